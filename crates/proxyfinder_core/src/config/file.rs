//! Provider reading `proxy` and `ignore` keys from an INI-like file.
//!
//! # Responsibility
//! - Parse `key = value` lines with `#`/`;` comments and `[section]` headers.
//! - Serve the default section (keys before the first header).
//!
//! # Invariants
//! - Parsed values are reused only while the file's staleness token
//!   (mtime + length) matches the one recorded at parse time.
//! - A missing file is "nothing configured", not an error.
//! - Writers re-validate the cache after taking the write lock.

use super::{ConfigProvider, ProviderError, ProviderResult, ProxyConfig, Tier};
use crate::extension::Extension;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;
use url::Url;

pub const SYSTEM_PROVIDER_ID: &str = "config_file_system";
pub const USER_PROVIDER_ID: &str = "config_file_user";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/proxy.conf";
pub const USER_CONFIG_FILE: &str = ".proxy.conf";

const DEFAULT_SECTION: &str = "";
const KEY_PROXY: &str = "proxy";
const KEY_IGNORE: &str = "ignore";

static SECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[\s*([^\]]*?)\s*\]$").expect("valid section regex"));
static ENTRY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^=]+?)\s*=\s*(.*)$").expect("valid entry regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StalenessToken {
    modified: Option<SystemTime>,
    len: u64,
}

#[derive(Debug, Clone)]
struct CachedParse {
    token: StalenessToken,
    sections: HashMap<String, HashMap<String, String>>,
}

/// Cached parse no longer matches the file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StaleCacheMiss;

impl Display for StaleCacheMiss {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "cached parse state is stale")
    }
}

impl Error for StaleCacheMiss {}

impl CachedParse {
    fn validate(&self, token: StalenessToken) -> Result<&Self, StaleCacheMiss> {
        if self.token == token {
            Ok(self)
        } else {
            Err(StaleCacheMiss)
        }
    }

    fn config(&self) -> Option<ProxyConfig> {
        let section = self.sections.get(DEFAULT_SECTION)?;
        let url = section.get(KEY_PROXY).cloned();
        url.as_ref()?;
        Some(ProxyConfig {
            url,
            ignore: section.get(KEY_IGNORE).cloned(),
        })
    }
}

pub struct FileConfigProvider {
    id: String,
    tier: Tier,
    path: PathBuf,
    cache: RwLock<Option<CachedParse>>,
}

impl FileConfigProvider {
    pub fn at(path: impl Into<PathBuf>, tier: Tier, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier,
            path: path.into(),
            cache: RwLock::new(None),
        }
    }

    /// `/etc/proxy.conf`, tier SYSTEM.
    pub fn system() -> Self {
        Self::at(SYSTEM_CONFIG_PATH, Tier::System, SYSTEM_PROVIDER_ID)
    }

    /// `$HOME/.proxy.conf`, tier USER. `None` when `HOME` is unset or empty.
    pub fn user() -> Option<Self> {
        let home = std::env::var_os("HOME").filter(|home| !home.is_empty())?;
        Some(Self::at(
            Path::new(&home).join(USER_CONFIG_FILE),
            Tier::User,
            USER_PROVIDER_ID,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staleness_token(&self) -> ProviderResult<Option<StalenessToken>> {
        match std::fs::metadata(&self.path) {
            Ok(metadata) => Ok(Some(StalenessToken {
                modified: metadata.modified().ok(),
                len: metadata.len(),
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ProviderError::Io {
                path: self.path.clone(),
                source: err,
            }),
        }
    }

    fn cached_config(&self, token: StalenessToken) -> Result<Option<ProxyConfig>, StaleCacheMiss> {
        let guard = self
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(cached) => cached.validate(token).map(CachedParse::config),
            None => Err(StaleCacheMiss),
        }
    }

    fn reparse(&self, token: StalenessToken) -> ProviderResult<Option<ProxyConfig>> {
        let mut guard = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cached) = guard.as_ref() {
            if let Ok(fresh) = cached.validate(token) {
                return Ok(fresh.config());
            }
        }

        let content = std::fs::read_to_string(&self.path).map_err(|err| ProviderError::Io {
            path: self.path.clone(),
            source: err,
        })?;
        let parsed = CachedParse {
            token,
            sections: parse_sections(&content),
        };
        debug!(
            "event=config_file_parse module=config status=ok provider={} sections={}",
            self.id,
            parsed.sections.len()
        );
        let config = parsed.config();
        *guard = Some(parsed);
        Ok(config)
    }

    fn clear(&self) {
        let mut guard = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = None;
    }
}

fn parse_sections(content: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current = DEFAULT_SECTION.to_string();

    for raw_line in content.lines() {
        let line = raw_line.trim_matches([' ', '\t']);
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(captures) = SECTION_RE.captures(line) {
            current = captures[1].to_string();
        } else if let Some(captures) = ENTRY_RE.captures(line) {
            sections
                .entry(current.clone())
                .or_default()
                .insert(captures[1].trim().to_string(), captures[2].trim().to_string());
        }
    }

    sections
}

impl Extension for FileConfigProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn shutdown(&self) {
        self.clear();
    }
}

impl ConfigProvider for FileConfigProvider {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn get_config(&self, _target: &Url) -> ProviderResult<Option<ProxyConfig>> {
        let Some(token) = self.staleness_token()? else {
            self.clear();
            return Ok(None);
        };

        match self.cached_config(token) {
            Ok(config) => Ok(config),
            Err(StaleCacheMiss) => self.reparse(token).inspect_err(|err| {
                warn!(
                    "event=config_file_parse module=config status=error provider={} error={}",
                    self.id, err
                );
            }),
        }
    }

    fn invalidate(&self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_sections, FileConfigProvider};
    use crate::config::{ConfigProvider, Tier};
    use url::Url;

    fn target() -> Url {
        Url::parse("http://example.com/").expect("test url should parse")
    }

    #[test]
    fn parses_default_section_and_ignores_comments() {
        let sections = parse_sections(
            "# comment\n; other\n proxy = http://proxy:3128 \nignore=.local\n[extra]\nproxy=socks://x:1\n",
        );
        let default = sections.get("").expect("default section");
        assert_eq!(default.get("proxy").map(String::as_str), Some("http://proxy:3128"));
        assert_eq!(default.get("ignore").map(String::as_str), Some(".local"));
        assert_eq!(
            sections
                .get("extra")
                .and_then(|section| section.get("proxy"))
                .map(String::as_str),
            Some("socks://x:1")
        );
    }

    #[test]
    fn missing_file_is_not_configured() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let provider = FileConfigProvider::at(dir.path().join("absent.conf"), Tier::User, "f");
        assert!(provider
            .get_config(&target())
            .expect("missing file is not an error")
            .is_none());
    }

    #[test]
    fn rereads_file_after_content_changes() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("proxy.conf");
        std::fs::write(&path, "proxy = http://first:3128\n").expect("write first config");

        let provider = FileConfigProvider::at(&path, Tier::System, "config_file_test");
        let first = provider
            .get_config(&target())
            .expect("read first config")
            .expect("first config present");
        assert_eq!(first.candidate(), Some("http://first:3128"));

        std::fs::write(&path, "proxy = http://second-proxy:8080\n").expect("write second config");
        let second = provider
            .get_config(&target())
            .expect("read second config")
            .expect("second config present");
        assert_eq!(second.candidate(), Some("http://second-proxy:8080"));
    }

    #[test]
    fn file_without_proxy_key_has_no_candidate() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("proxy.conf");
        std::fs::write(&path, "ignore = .local\n").expect("write config");

        let provider = FileConfigProvider::at(&path, Tier::User, "f");
        assert!(provider.get_config(&target()).expect("read config").is_none());
    }
}
