//! Config provider contracts and built-in providers.
//!
//! # Responsibility
//! - Define what a config provider returns for one target URL.
//! - Provide the tierless environment-variable provider, file providers for
//!   system and user config, and a caller-driven static provider.
//!
//! # Invariants
//! - `get_config` returns a fresh value on every call; callers own it.
//! - Providers own their cache locks and never expose cached state.
//! - A provider that cannot read its store reports `ProviderError`; "nothing
//!   configured" is `Ok(None)`.
//!
//! # See also
//! - `factory` for arbitration across providers.

pub mod candidate;
pub mod env;
pub mod file;
pub mod static_provider;
pub mod tier;

pub use candidate::Candidate;
pub use env::EnvConfigProvider;
pub use file::FileConfigProvider;
pub use static_provider::StaticConfigProvider;
pub use tier::{Tier, TierError};

use crate::extension::Extension;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use url::Url;

/// Provider answer for one target URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Candidate value, see [`Candidate`].
    pub url: Option<String>,
    /// Comma-separated ignore patterns.
    pub ignore: Option<String>,
}

impl ProxyConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ignore: None,
        }
    }

    pub fn with_ignore(mut self, ignore: impl Into<String>) -> Self {
        self.ignore = Some(ignore.into());
        self
    }

    /// Returns the trimmed candidate when one is present.
    pub fn candidate(&self) -> Option<&str> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// Failure to read a provider's backing store.
#[derive(Debug)]
pub enum ProviderError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Unavailable(String),
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read `{}`: {source}", path.display())
            }
            Self::Unavailable(reason) => write!(f, "provider store unavailable: {reason}"),
        }
    }
}

impl Error for ProviderError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Unavailable(_) => None,
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Source of proxy configuration for the arbitration step.
pub trait ConfigProvider: Extension {
    fn tier(&self) -> Tier;

    /// Reads configuration for `target`.
    fn get_config(&self, target: &Url) -> ProviderResult<Option<ProxyConfig>>;

    /// Discards cached parse state so the next read hits the store.
    fn invalidate(&self) {}
}

#[cfg(test)]
mod tests {
    use super::ProxyConfig;

    #[test]
    fn blank_candidate_is_absent() {
        assert_eq!(ProxyConfig::new("   ").candidate(), None);
        assert_eq!(ProxyConfig::default().candidate(), None);
        assert_eq!(
            ProxyConfig::new(" wpad:// ").candidate(),
            Some("wpad://")
        );
    }

    #[test]
    fn serializes_with_plain_field_names() {
        let config = ProxyConfig::new("http://proxy:3128").with_ignore(".local");
        let json = serde_json::to_value(&config).expect("config should serialize");
        assert_eq!(json["url"], "http://proxy:3128");
        assert_eq!(json["ignore"], ".local");
    }
}
