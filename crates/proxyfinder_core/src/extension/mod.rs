//! Extension contracts and in-process registry.
//!
//! Config providers, WPAD discovery probes and network monitors are all
//! extensions: independently constructed objects the engine only sees through
//! their capability trait. The registry groups them by capability type and
//! hands them back in priority order.

pub mod order;
pub mod registry;

pub use order::{ConfigOrder, OrderError, OrderSegment, PriorityTable};
pub use registry::{
    ExtensionId, ExtensionRegistry, ExtensionRegistryError, ProviderUnavailable, TypeSpec,
};

/// Common contract for every registrable extension.
pub trait Extension: Send + Sync {
    /// Stable identifier, e.g. `config_envvar` or `wpad_dns_alias`.
    ///
    /// Priority tables match against this value.
    fn id(&self) -> &str;

    /// Releases captured handles. Called once, before the registry drops the
    /// instance.
    fn shutdown(&self) {}
}
