//! Proxy resolution engine.
//!
//! Answers "which proxies should I try, in order, for this URL" by
//! arbitrating config providers, running WPAD discovery and PAC scripts, and
//! honoring ignore lists. [`ProxyFactory::get_proxies`] is the only query
//! operation; everything else configures or extends it.

pub mod config;
pub mod dns;
pub mod extension;
pub mod factory;
pub mod fetch;
pub mod ignore;
pub mod logging;
pub mod pac;
pub mod settings;
pub mod wpad;

pub use config::{
    Candidate, ConfigProvider, EnvConfigProvider, FileConfigProvider, ProviderError,
    ProviderResult, ProxyConfig, StaticConfigProvider, Tier, TierError,
};
pub use dns::{HostResolver, SystemResolver};
pub use extension::{
    ConfigOrder, Extension, ExtensionId, ExtensionRegistry, ExtensionRegistryError,
    PriorityTable, ProviderUnavailable, TypeSpec,
};
pub use factory::{InvalidationHandle, NetworkMonitor, ProxyFactory, ResolveError, ResolveResult};
pub use fetch::{FetchError, HttpPacFetcher, PacFetcher};
pub use ignore::IgnoreList;
pub use logging::{default_log_level, init_logging};
pub use pac::{evaluate, parse_directives, PacError, PacLimits, PacRunner};
pub use settings::{Settings, SettingsError};
pub use wpad::{DiscoveryExhausted, DiscoveryProvider, DnsAliasDiscovery, WpadChain};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
