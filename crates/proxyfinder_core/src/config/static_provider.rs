//! Provider holding a caller-supplied configuration.
//!
//! Embedders use it to inject session settings they already know; the value
//! can be replaced at runtime and is picked up on the next query.

use super::{ConfigProvider, ProviderResult, ProxyConfig, Tier};
use crate::extension::Extension;
use std::sync::RwLock;
use url::Url;

pub struct StaticConfigProvider {
    id: String,
    tier: Tier,
    config: RwLock<Option<ProxyConfig>>,
}

impl StaticConfigProvider {
    pub fn new(id: impl Into<String>, tier: Tier, config: Option<ProxyConfig>) -> Self {
        Self {
            id: id.into(),
            tier,
            config: RwLock::new(config),
        }
    }

    /// Replaces the held value. `None` means "nothing configured".
    pub fn set(&self, config: Option<ProxyConfig>) {
        let mut guard = self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = config;
    }
}

impl Extension for StaticConfigProvider {
    fn id(&self) -> &str {
        &self.id
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn get_config(&self, _target: &Url) -> ProviderResult<Option<ProxyConfig>> {
        let guard = self
            .config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.clone())
    }
}
