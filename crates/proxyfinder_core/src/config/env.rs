//! Tierless provider backed by the conventional `*_proxy` variables.

use super::{ConfigProvider, ProviderResult, ProxyConfig, Tier};
use crate::extension::Extension;
use std::sync::Arc;
use url::Url;

pub const ENV_PROVIDER_ID: &str = "config_envvar";

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct EnvConfigProvider {
    lookup: EnvLookup,
}

impl EnvConfigProvider {
    /// Reads the process environment.
    pub fn new() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    /// Reads variables through `lookup` instead of the process environment.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    fn var(&self, lower: &str) -> Option<String> {
        (self.lookup)(lower)
            .or_else(|| (self.lookup)(&lower.to_ascii_uppercase()))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn proxy_for(&self, target: &Url) -> Option<String> {
        let scheme_specific = match target.scheme() {
            "ftp" => self.var("ftp_proxy"),
            "https" => self.var("https_proxy"),
            _ => None,
        };
        scheme_specific.or_else(|| self.var("http_proxy"))
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn with_default_scheme(value: String) -> String {
    if value.contains("://") {
        value
    } else {
        format!("http://{value}")
    }
}

impl Extension for EnvConfigProvider {
    fn id(&self) -> &str {
        ENV_PROVIDER_ID
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn tier(&self) -> Tier {
        Tier::None
    }

    fn get_config(&self, target: &Url) -> ProviderResult<Option<ProxyConfig>> {
        let Some(proxy) = self.proxy_for(target) else {
            return Ok(None);
        };

        Ok(Some(ProxyConfig {
            url: Some(with_default_scheme(proxy)),
            ignore: self.var("no_proxy"),
        }))
    }
}
