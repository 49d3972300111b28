//! Engine settings: order policies, timeouts and size limits.
//!
//! # Responsibility
//! - Hold every tunable the factory and its collaborators read.
//! - Apply `PX_CONFIG_ORDER` / `PX_WPAD_ORDER` overrides.
//!
//! # Invariants
//! - A validated `Settings` always yields parseable order tables and non-zero
//!   time and size bounds.

use crate::dns::DEFAULT_DNS_TIMEOUT;
use crate::extension::order::{DEFAULT_CONFIG_ORDER, DEFAULT_WPAD_ORDER};
use crate::extension::{ConfigOrder, OrderError, PriorityTable};
use crate::fetch::{DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_PAC_SIZE};
use crate::pac::{PacLimits, DEFAULT_SCRIPT_MEMORY_LIMIT, DEFAULT_SCRIPT_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub const ENV_CONFIG_ORDER: &str = "PX_CONFIG_ORDER";
pub const ENV_WPAD_ORDER: &str = "PX_WPAD_ORDER";

#[derive(Debug)]
pub enum SettingsError {
    InvalidOrder {
        field: &'static str,
        source: OrderError,
    },
    ZeroLimit(&'static str),
}

impl Display for SettingsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidOrder { field, source } => {
                write!(f, "invalid order policy for `{field}`: {source}")
            }
            Self::ZeroLimit(field) => write!(f, "`{field}` must be greater than zero"),
        }
    }
}

impl Error for SettingsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidOrder { source, .. } => Some(source),
            Self::ZeroLimit(_) => None,
        }
    }
}

pub type SettingsResult<T> = Result<T, SettingsError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Comma-separated tier names and provider-id markers.
    pub config_order: String,
    /// Comma-separated WPAD provider-id markers.
    pub wpad_order: String,
    pub dns_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    pub max_pac_size: u64,
    pub script_timeout_ms: u64,
    pub script_memory_limit: usize,
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_order: DEFAULT_CONFIG_ORDER.to_string(),
            wpad_order: DEFAULT_WPAD_ORDER.to_string(),
            dns_timeout_ms: duration_ms(DEFAULT_DNS_TIMEOUT),
            fetch_timeout_ms: duration_ms(DEFAULT_FETCH_TIMEOUT),
            max_pac_size: DEFAULT_MAX_PAC_SIZE,
            script_timeout_ms: duration_ms(DEFAULT_SCRIPT_TIMEOUT),
            script_memory_limit: DEFAULT_SCRIPT_MEMORY_LIMIT,
        }
    }
}

impl Settings {
    /// Defaults plus process-environment overrides.
    pub fn from_env() -> SettingsResult<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies order overrides read through `lookup`.
    ///
    /// `PX_CONFIG_ORDER` segments are consulted before the existing config
    /// order; `PX_WPAD_ORDER` replaces the WPAD order.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> SettingsResult<Self> {
        if let Some(value) = lookup(ENV_CONFIG_ORDER).filter(|value| !value.trim().is_empty()) {
            self.config_order = format!("{},{}", value.trim(), self.config_order);
        }
        if let Some(value) = lookup(ENV_WPAD_ORDER).filter(|value| !value.trim().is_empty()) {
            self.wpad_order = value.trim().to_string();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> SettingsResult<()> {
        self.config_order()?;
        self.wpad_table()?;
        for (field, value) in [
            ("dns_timeout_ms", self.dns_timeout_ms),
            ("fetch_timeout_ms", self.fetch_timeout_ms),
            ("max_pac_size", self.max_pac_size),
            ("script_timeout_ms", self.script_timeout_ms),
            ("script_memory_limit", self.script_memory_limit as u64),
        ] {
            if value == 0 {
                return Err(SettingsError::ZeroLimit(field));
            }
        }
        Ok(())
    }

    pub fn config_order(&self) -> SettingsResult<ConfigOrder> {
        ConfigOrder::parse(&self.config_order).map_err(|source| SettingsError::InvalidOrder {
            field: "config_order",
            source,
        })
    }

    pub fn wpad_table(&self) -> SettingsResult<PriorityTable> {
        PriorityTable::parse(&self.wpad_order).map_err(|source| SettingsError::InvalidOrder {
            field: "wpad_order",
            source,
        })
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn pac_limits(&self) -> PacLimits {
        PacLimits {
            timeout: Duration::from_millis(self.script_timeout_ms),
            memory_limit: self.script_memory_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Settings, SettingsError};
    use crate::config::Tier;
    use crate::extension::OrderError;
    use std::time::Duration;

    #[test]
    fn defaults_validate() {
        let settings = Settings::default();
        settings.validate().expect("defaults should be valid");
        assert_eq!(settings.dns_timeout(), Duration::from_secs(2));
        assert_eq!(settings.fetch_timeout(), Duration::from_secs(5));
        assert_eq!(settings.max_pac_size, 100 * 1024);
        assert_eq!(settings.pac_limits().timeout, Duration::from_secs(1));
    }

    #[test]
    fn config_order_override_is_consulted_first() {
        let settings = Settings::default()
            .with_overrides(|name| (name == "PX_CONFIG_ORDER").then(|| "config_envvar".to_string()))
            .expect("override should be accepted");
        let order = settings.config_order().expect("order should parse");
        assert_eq!(order.rank(Tier::None, "config_envvar"), 0);
        assert!(order.rank(Tier::Session, "config_gnome") < order.rank(Tier::None, "config_kde"));
    }

    #[test]
    fn wpad_override_replaces_table() {
        let settings = Settings::default()
            .with_overrides(|name| (name == "PX_WPAD_ORDER").then(|| "dns_alias,dhcp".to_string()))
            .expect("override should be accepted");
        let table = settings.wpad_table().expect("table should parse");
        assert_eq!(table.rank("wpad_dns_alias"), 0);
        assert_eq!(table.rank("wpad_dhcp"), 1);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Settings::default()
            .with_overrides(|name| (name == "PX_WPAD_ORDER").then(|| "dhcp,,slp".to_string()))
            .expect_err("empty segment must fail");
        assert!(matches!(
            err,
            SettingsError::InvalidOrder {
                field: "wpad_order",
                source: OrderError::EmptySegment { position: 1 }
            }
        ));

        let zero = Settings {
            fetch_timeout_ms: 0,
            ..Settings::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(SettingsError::ZeroLimit("fetch_timeout_ms"))
        ));
    }

    #[test]
    fn deserializes_partial_documents_with_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"script_timeout_ms": 250}"#).expect("partial settings");
        assert_eq!(settings.script_timeout_ms, 250);
        assert_eq!(settings.wpad_order, Settings::default().wpad_order);
    }
}
