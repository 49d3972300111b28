//! Proxy factory: the resolution engine's single query surface.
//!
//! # Responsibility
//! - Arbitrate between config providers by the config order policy.
//! - Apply the winner's ignore list, then route to WPAD, PAC or the literal
//!   directive list.
//! - Cache the compiled PAC script and the WPAD chain across queries until
//!   the configuration or the network changes.
//!
//! # Invariants
//! - `get_proxies` never returns an empty list for a well-formed URL.
//! - The cache lock is never held across a fetch, DNS lookup or script run.
//! - The registry lock is only held long enough to snapshot instance lists.
//! - Every `invalidate()` bumps the network generation; results computed
//!   under an older generation are not cached. The bump and the store-time
//!   comparison both happen under the cache lock.
//!
//! # See also
//! - `config` for provider contracts and the candidate grammar.
//! - `wpad`, `pac`, `fetch`, `ignore` for the individual pipeline stages.

use crate::config::candidate::DIRECT;
use crate::config::{
    Candidate, ConfigProvider, EnvConfigProvider, FileConfigProvider, ProxyConfig,
};
use crate::dns::{HostResolver, SystemResolver};
use crate::extension::{
    ConfigOrder, Extension, ExtensionId, ExtensionRegistry, ExtensionRegistryError,
    PriorityTable, TypeSpec,
};
use crate::fetch::{HttpPacFetcher, PacFetcher};
use crate::ignore::IgnoreList;
use crate::logging::loggable_url;
use crate::pac::{parse_directives, PacLimits, PacRunner};
use crate::settings::{Settings, SettingsResult};
use crate::wpad::{DiscoveryExhausted, DiscoveryProvider, DnsAliasDiscovery, WpadChain};
use log::{debug, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Instant;
use url::Url;

/// Reports network topology changes when polled.
pub trait NetworkMonitor: Extension {
    /// Whether the network changed since the previous poll.
    fn changed(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    InvalidInput(String),
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput(reason) => write!(f, "invalid target url: {reason}"),
        }
    }
}

impl Error for ResolveError {}

pub type ResolveResult<T> = Result<T, ResolveError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacMode {
    Wpad,
    Pac,
}

impl PacMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Wpad => "wpad",
            Self::Pac => "pac",
        }
    }
}

struct PacCache {
    location: Url,
    runner: Arc<PacRunner>,
}

#[derive(Default)]
struct CacheState {
    mode: Option<PacMode>,
    pac: Option<PacCache>,
    wpad: Option<Arc<WpadChain>>,
}

/// Resolver indirection so `with_resolver` also reaches providers built
/// before it was called.
struct ResolverSlot {
    current: RwLock<Arc<dyn HostResolver>>,
}

impl ResolverSlot {
    fn get(&self) -> Arc<dyn HostResolver> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    fn set(&self, resolver: Arc<dyn HostResolver>) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = resolver;
    }
}

impl HostResolver for ResolverSlot {
    fn resolve(&self, host: &str) -> Option<IpAddr> {
        self.get().resolve(host)
    }

    fn local_address(&self) -> Option<IpAddr> {
        self.get().local_address()
    }
}

struct FactoryInner {
    wpad_table: PriorityTable,
    pac_limits: PacLimits,
    registry: RwLock<ExtensionRegistry>,
    fetcher: RwLock<Arc<dyn PacFetcher>>,
    resolver: Arc<ResolverSlot>,
    cache: Mutex<CacheState>,
    generation: AtomicU64,
}

/// Weak handle that lets an external watcher trigger `invalidate()`.
#[derive(Clone)]
pub struct InvalidationHandle {
    inner: Weak<FactoryInner>,
}

impl InvalidationHandle {
    /// Returns `false` when the factory is already gone.
    pub fn invalidate(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                inner.invalidate("handle");
                true
            }
            None => false,
        }
    }
}

pub struct ProxyFactory {
    inner: Arc<FactoryInner>,
    settings: Settings,
}

impl ProxyFactory {
    /// Creates a factory with no providers registered.
    ///
    /// # Errors
    /// - Returns `SettingsError` when `settings` fail validation.
    pub fn new(settings: Settings) -> SettingsResult<Self> {
        settings.validate()?;
        let config_order = settings.config_order()?;
        let wpad_table = settings.wpad_table()?;

        let mut registry = ExtensionRegistry::new();
        declare_types(&mut registry, config_order, wpad_table.clone());

        let resolver: Arc<dyn HostResolver> = Arc::new(SystemResolver::new(settings.dns_timeout()));
        let fetcher: Arc<dyn PacFetcher> = Arc::new(HttpPacFetcher::new(
            settings.fetch_timeout(),
            settings.max_pac_size,
        ));

        info!(
            "event=factory_init module=factory status=ok config_order={} wpad_order={}",
            settings.config_order, settings.wpad_order
        );
        Ok(Self {
            inner: Arc::new(FactoryInner {
                wpad_table,
                pac_limits: settings.pac_limits(),
                registry: RwLock::new(registry),
                fetcher: RwLock::new(fetcher),
                resolver: Arc::new(ResolverSlot {
                    current: RwLock::new(resolver),
                }),
                cache: Mutex::new(CacheState::default()),
                generation: AtomicU64::new(0),
            }),
            settings,
        })
    }

    /// Creates a factory with the environment-variable provider, the system
    /// and user config files (when present) and DNS alias WPAD discovery.
    pub fn with_builtin_providers(settings: Settings) -> SettingsResult<Self> {
        let factory = Self::new(settings)?;
        let resolver: Arc<dyn HostResolver> = factory.inner.resolver.clone();

        factory.with_registry(|registry| {
            let results = [
                registry.register::<dyn ConfigProvider, _, _>(
                    || Ok(Arc::new(EnvConfigProvider::new()) as Arc<dyn ConfigProvider>),
                    || true,
                ),
                register_file_provider(registry, Some(FileConfigProvider::system())),
                register_file_provider(registry, FileConfigProvider::user()),
                registry.register::<dyn DiscoveryProvider, _, _>(
                    || {
                        Ok(Arc::new(DnsAliasDiscovery::from_system(resolver))
                            as Arc<dyn DiscoveryProvider>)
                    },
                    || true,
                ),
            ];
            for result in results {
                if let Err(err) = result {
                    warn!(
                        "event=builtin_register module=factory status=error error={}",
                        err
                    );
                }
            }
        });
        Ok(factory)
    }

    /// Replaces the PAC fetcher.
    pub fn with_fetcher(self, fetcher: Arc<dyn PacFetcher>) -> Self {
        {
            let mut guard = self
                .inner
                .fetcher
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = fetcher;
        }
        self.inner.clear_pac_cache();
        self
    }

    /// Replaces the host resolver used by PAC helpers and built-in discovery.
    pub fn with_resolver(self, resolver: Arc<dyn HostResolver>) -> Self {
        self.inner.resolver.set(resolver);
        self.inner.clear_pac_cache();
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn register_config_provider(
        &self,
        provider: Arc<dyn ConfigProvider>,
    ) -> Result<Option<ExtensionId>, ExtensionRegistryError> {
        self.with_registry(|registry| registry.register_instance(provider))
    }

    pub fn register_discovery_provider(
        &self,
        provider: Arc<dyn DiscoveryProvider>,
    ) -> Result<Option<ExtensionId>, ExtensionRegistryError> {
        self.with_registry(|registry| registry.register_instance(provider))
    }

    pub fn register_network_monitor(
        &self,
        monitor: Arc<dyn NetworkMonitor>,
    ) -> Result<Option<ExtensionId>, ExtensionRegistryError> {
        self.with_registry(|registry| registry.register_instance(monitor))
    }

    /// Runs `f` with exclusive registry access. The cached WPAD chain is
    /// rebuilt on the next discovery.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut ExtensionRegistry) -> R) -> R {
        let result = {
            let mut registry = self.inner.registry_write();
            f(&mut registry)
        };
        self.inner.lock_cache().wpad = None;
        result
    }

    pub fn invalidate(&self) {
        self.inner.invalidate("caller");
    }

    pub fn invalidation_handle(&self) -> InvalidationHandle {
        InvalidationHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn network_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Returns the ordered proxy list for `target_url`.
    ///
    /// Entries are `direct://` or proxy URLs such as `http://host:port`.
    ///
    /// # Errors
    /// - [`ResolveError::InvalidInput`] when `target_url` is not an absolute
    ///   URL, or a hierarchical URL without a host.
    pub fn get_proxies(&self, target_url: &str) -> ResolveResult<Vec<String>> {
        let started_at = Instant::now();
        let target = parse_target(target_url)?;

        self.inner.poll_monitors();
        let generation = self.network_generation();

        let Some((provider_id, config)) = self.inner.select_config(&target) else {
            debug!(
                "event=get_proxies module=factory status=ok kind=unconfigured duration_ms={}",
                started_at.elapsed().as_millis()
            );
            return Ok(direct());
        };

        if let Some(ignore) = config.ignore.as_deref() {
            if IgnoreList::parse(ignore).bypasses(&target) {
                debug!(
                    "event=get_proxies module=factory status=ok kind=ignored provider={} duration_ms={}",
                    provider_id,
                    started_at.elapsed().as_millis()
                );
                return Ok(direct());
            }
        }

        let raw = config.candidate().unwrap_or(DIRECT);
        let candidate = match Candidate::classify(raw) {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(
                    "event=config_candidate module=factory status=error provider={} error={}",
                    provider_id, err
                );
                return Ok(direct());
            }
        };

        let kind = candidate.kind();
        let proxies = match candidate {
            Candidate::Direct => direct(),
            Candidate::Directives(list) => {
                self.inner.clear_pac_cache();
                list
            }
            Candidate::Wpad => self.inner.resolve_wpad(&target, generation),
            Candidate::Pac(location) => self.inner.resolve_pac(&target, location, generation),
        };
        let proxies = if proxies.is_empty() { direct() } else { proxies };

        debug!(
            "event=get_proxies module=factory status=ok kind={} provider={} count={} duration_ms={}",
            kind,
            provider_id,
            proxies.len(),
            started_at.elapsed().as_millis()
        );
        Ok(proxies)
    }

    /// Shuts down every registered extension and drops cached state.
    pub fn teardown(&self) {
        self.inner.registry_write().teardown();
        let mut cache = self.inner.lock_cache();
        *cache = CacheState::default();
    }
}

impl Drop for ProxyFactory {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn declare_types(registry: &mut ExtensionRegistry, config_order: ConfigOrder, wpad: PriorityTable) {
    registry.register_type(
        TypeSpec::<dyn ConfigProvider>::new("config").ordered_by(move |a, b| {
            config_order.rank(a.tier(), a.id()) < config_order.rank(b.tier(), b.id())
        }),
    );
    registry.register_type(
        TypeSpec::<dyn DiscoveryProvider>::new("wpad")
            .ordered_by(move |a, b| wpad.rank(a.id()) < wpad.rank(b.id())),
    );
    registry.register_type(TypeSpec::<dyn NetworkMonitor>::new("network"));
}

fn register_file_provider(
    registry: &mut ExtensionRegistry,
    provider: Option<FileConfigProvider>,
) -> Result<Option<ExtensionId>, ExtensionRegistryError> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let exists = provider.path().is_file();
    registry.register::<dyn ConfigProvider, _, _>(
        move || Ok(Arc::new(provider) as Arc<dyn ConfigProvider>),
        || exists,
    )
}

fn parse_target(target_url: &str) -> ResolveResult<Url> {
    let target = Url::parse(target_url.trim())
        .map_err(|err| ResolveError::InvalidInput(err.to_string()))?;
    let hierarchical = !target.cannot_be_a_base();
    let has_host = target.host_str().is_some_and(|host| !host.is_empty());
    if hierarchical && !has_host && target.scheme() != "file" {
        return Err(ResolveError::InvalidInput(format!(
            "{} url has no host",
            target.scheme()
        )));
    }
    Ok(target)
}

fn direct() -> Vec<String> {
    vec![DIRECT.to_string()]
}

impl FactoryInner {
    fn registry_read(&self) -> RwLockReadGuard<'_, ExtensionRegistry> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn registry_write(&self) -> RwLockWriteGuard<'_, ExtensionRegistry> {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_cache(&self) -> MutexGuard<'_, CacheState> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fetcher(&self) -> Arc<dyn PacFetcher> {
        let guard = self
            .fetcher
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    fn clear_pac_cache(&self) {
        let mut cache = self.lock_cache();
        cache.mode = None;
        cache.pac = None;
    }

    fn poll_monitors(&self) {
        let monitors = self.registry_read().extensions_of::<dyn NetworkMonitor>();
        let mut changed_by = None;
        for monitor in &monitors {
            if monitor.changed() && changed_by.is_none() {
                changed_by = Some(monitor.id().to_string());
            }
        }
        if let Some(monitor) = changed_by {
            self.invalidate(&monitor);
        }
    }

    fn invalidate(&self, source: &str) {
        let (providers, discovery) = {
            let registry = self.registry_read();
            (
                registry.extensions_of::<dyn ConfigProvider>(),
                registry.extensions_of::<dyn DiscoveryProvider>(),
            )
        };
        for provider in &providers {
            provider.invalidate();
        }

        let (generation, chain) = {
            let mut cache = self.lock_cache();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            cache.mode = None;
            cache.pac = None;
            (generation, cache.wpad.clone())
        };
        match chain {
            Some(chain) => chain.rewind(),
            None => discovery.iter().for_each(|extension| extension.rewind()),
        }

        info!(
            "event=invalidate module=factory status=ok source={} generation={}",
            source, generation
        );
    }

    fn select_config(&self, target: &Url) -> Option<(String, ProxyConfig)> {
        let providers = self.registry_read().extensions_of::<dyn ConfigProvider>();
        for provider in providers {
            match provider.get_config(target) {
                Ok(Some(config)) if config.candidate().is_some() => {
                    debug!(
                        "event=config_select module=factory status=ok provider={} tier={}",
                        provider.id(),
                        provider.tier()
                    );
                    return Some((provider.id().to_string(), config));
                }
                Ok(_) => {}
                Err(err) => warn!(
                    "event=config_select module=factory status=error provider={} error={}",
                    provider.id(),
                    err
                ),
            }
        }
        None
    }

    /// Returns the cached runner for `mode`, switching modes when needed.
    /// `location` of `None` accepts any cached location.
    fn cached_runner(&self, mode: PacMode, location: Option<&Url>) -> Option<Arc<PacRunner>> {
        let mut cache = self.lock_cache();
        if cache.mode != Some(mode) {
            if cache.mode.is_some() {
                debug!(
                    "event=pac_cache_reset module=factory status=ok reason=mode_switch mode={}",
                    mode.as_str()
                );
            }
            cache.mode = Some(mode);
            cache.pac = None;
            return None;
        }

        let matches = match (&cache.pac, location) {
            (Some(cached), Some(location)) => cached.location == *location,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            cache.pac = None;
            return None;
        }
        cache.pac.as_ref().map(|cached| Arc::clone(&cached.runner))
    }

    fn store_runner(&self, mode: PacMode, location: Url, runner: Arc<PacRunner>, generation: u64) {
        let mut cache = self.lock_cache();
        // `invalidate` bumps the generation under this same lock.
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(
                "event=pac_cache_store module=factory status=skip reason=stale_generation mode={}",
                mode.as_str()
            );
            return;
        }
        cache.mode = Some(mode);
        cache.pac = Some(PacCache { location, runner });
    }

    fn load_runner(&self, location: &Url) -> Option<Arc<PacRunner>> {
        let script = self.fetcher().fetch(location).ok()?;
        let resolver: Arc<dyn HostResolver> = self.resolver.clone();
        match PacRunner::new(&script, resolver, self.pac_limits) {
            Ok(runner) => Some(Arc::new(runner)),
            Err(err) => {
                warn!(
                    "event=pac_load module=factory status=error location={} error={}",
                    loggable_url(location),
                    err
                );
                None
            }
        }
    }

    fn resolve_pac(&self, target: &Url, location: Url, generation: u64) -> Vec<String> {
        let runner = match self.cached_runner(PacMode::Pac, Some(&location)) {
            Some(runner) => runner,
            None => {
                let Some(runner) = self.load_runner(&location) else {
                    return direct();
                };
                self.store_runner(PacMode::Pac, location, Arc::clone(&runner), generation);
                runner
            }
        };
        run_script(&runner, target)
    }

    fn wpad_chain(&self) -> Arc<WpadChain> {
        if let Some(chain) = self.lock_cache().wpad.clone() {
            return chain;
        }
        let extensions = self.registry_read().extensions_of::<dyn DiscoveryProvider>();
        let chain = Arc::new(WpadChain::new(extensions, &self.wpad_table));
        let mut cache = self.lock_cache();
        Arc::clone(cache.wpad.get_or_insert(chain))
    }

    fn discover(&self, chain: &WpadChain) -> Result<(Url, Arc<PacRunner>), DiscoveryExhausted> {
        if let Some(hit) = chain.next_loaded(|location| self.load_runner(location)) {
            return Ok(hit);
        }
        if !chain.found() {
            return Err(DiscoveryExhausted);
        }
        debug!("event=wpad_retry module=factory status=ok");
        chain.rewind();
        chain
            .next_loaded(|location| self.load_runner(location))
            .ok_or(DiscoveryExhausted)
    }

    fn resolve_wpad(&self, target: &Url, generation: u64) -> Vec<String> {
        let runner = match self.cached_runner(PacMode::Wpad, None) {
            Some(runner) => runner,
            None => {
                let chain = self.wpad_chain();
                match self.discover(&chain) {
                    Ok((location, runner)) => {
                        self.store_runner(PacMode::Wpad, location, Arc::clone(&runner), generation);
                        runner
                    }
                    Err(err) => {
                        info!(
                            "event=wpad_discover module=factory status=skip providers={} reason={}",
                            chain.len(),
                            err
                        );
                        return direct();
                    }
                }
            }
        };
        run_script(&runner, target)
    }
}

fn run_script(runner: &PacRunner, target: &Url) -> Vec<String> {
    let host = target.host_str().unwrap_or_default();
    runner
        .find_proxy(target.as_str(), host)
        .map(|result| parse_directives(&result))
        .unwrap_or_default()
}
