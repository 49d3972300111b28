//! WPAD discovery chain.
//!
//! # Responsibility
//! - Run registered discovery providers in priority-table order and hand out
//!   one PAC location per `next()` call.
//!
//! # Invariants
//! - The cursor only moves forward between rewinds; a provider that produced
//!   an accepted location is not asked again until `rewind()`.
//! - Within one step a provider is asked at most `MAX_LOCATIONS_PER_PROVIDER`
//!   times.
//! - The chain lock is never held while a provider performs discovery.
//! - `found()` reports whether any location was produced since the last
//!   rewind.

pub mod dns_alias;

pub use dns_alias::DnsAliasDiscovery;

use crate::extension::{Extension, PriorityTable};
use crate::logging::loggable_url;
use log::{debug, info};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use url::Url;

/// Bound on rejected locations taken from one provider per step.
pub const MAX_LOCATIONS_PER_PROVIDER: usize = 8;

/// Source of WPAD PAC locations.
pub trait DiscoveryProvider: Extension {
    /// Next candidate location, or `None` when this provider has nothing more.
    fn next(&self) -> Option<Url>;

    /// Restarts the provider's own candidate sequence.
    fn rewind(&self);
}

/// Every provider was asked and none produced a usable location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryExhausted;

impl Display for DiscoveryExhausted {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "WPAD discovery exhausted")
    }
}

impl Error for DiscoveryExhausted {}

#[derive(Debug, Default)]
struct ChainState {
    cursor: usize,
    found: bool,
}

pub struct WpadChain {
    extensions: Vec<Arc<dyn DiscoveryProvider>>,
    state: Mutex<ChainState>,
}

impl WpadChain {
    /// Orders `extensions` by `table`; ties keep the given order.
    pub fn new(mut extensions: Vec<Arc<dyn DiscoveryProvider>>, table: &PriorityTable) -> Self {
        extensions.sort_by_key(|extension| table.rank(extension.id()));
        debug!(
            "event=wpad_chain_build module=wpad status=ok providers={}",
            extensions
                .iter()
                .map(|extension| extension.id())
                .collect::<Vec<_>>()
                .join(",")
        );
        Self {
            extensions,
            state: Mutex::new(ChainState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ChainState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.extensions
            .iter()
            .map(|extension| extension.id().to_string())
            .collect()
    }

    /// Resets the cursor, clears `found` and rewinds every provider.
    pub fn rewind(&self) {
        {
            let mut state = self.lock_state();
            state.cursor = 0;
            state.found = false;
        }
        for extension in &self.extensions {
            extension.rewind();
        }
    }

    /// Asks providers from the cursor onward for a location.
    pub fn next(&self) -> Option<Url> {
        self.walk(1, |_| Some(())).map(|(location, ())| location)
    }

    /// Like [`WpadChain::next`], but hands each location to `load` and only
    /// stops at one it accepts.
    ///
    /// A provider whose location was rejected is asked again, up to
    /// `MAX_LOCATIONS_PER_PROVIDER` times, before the cursor moves past it.
    pub fn next_loaded<T>(&self, load: impl FnMut(&Url) -> Option<T>) -> Option<(Url, T)> {
        self.walk(MAX_LOCATIONS_PER_PROVIDER, load)
    }

    fn walk<T>(
        &self,
        attempts: usize,
        mut load: impl FnMut(&Url) -> Option<T>,
    ) -> Option<(Url, T)> {
        loop {
            let (index, extension) = {
                let state = self.lock_state();
                let extension = self.extensions.get(state.cursor)?;
                (state.cursor, Arc::clone(extension))
            };

            let mut accepted = None;
            for _ in 0..attempts {
                let Some(location) = extension.next() else {
                    break;
                };
                self.lock_state().found = true;
                match load(&location) {
                    Some(loaded) => {
                        accepted = Some((location, loaded));
                        break;
                    }
                    None => debug!(
                        "event=wpad_discover module=wpad status=rejected provider={} location={}",
                        extension.id(),
                        loggable_url(&location)
                    ),
                }
            }

            let mut state = self.lock_state();
            if state.cursor == index {
                state.cursor = index + 1;
            }
            if let Some((location, loaded)) = accepted {
                info!(
                    "event=wpad_discover module=wpad status=ok provider={} location={}",
                    extension.id(),
                    loggable_url(&location)
                );
                return Some((location, loaded));
            }
            debug!(
                "event=wpad_discover module=wpad status=skip provider={}",
                extension.id()
            );
        }
    }

    pub fn found(&self) -> bool {
        self.lock_state().found
    }
}

#[cfg(test)]
mod tests {
    use super::{DiscoveryProvider, WpadChain, MAX_LOCATIONS_PER_PROVIDER};
    use crate::extension::{Extension, PriorityTable};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use url::Url;

    struct OneShot {
        id: &'static str,
        location: Option<&'static str>,
        asked: AtomicUsize,
        rewound: AtomicUsize,
    }

    impl OneShot {
        fn new(id: &'static str, location: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                id,
                location,
                asked: AtomicUsize::new(0),
                rewound: AtomicUsize::new(0),
            })
        }
    }

    impl Extension for OneShot {
        fn id(&self) -> &str {
            self.id
        }
    }

    impl DiscoveryProvider for OneShot {
        fn next(&self) -> Option<Url> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.location
                .map(|location| Url::parse(location).expect("test location should parse"))
        }

        fn rewind(&self) {
            self.rewound.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dhcp_is_asked_before_dns_srv() {
        let srv = OneShot::new("wpad_dns_srv", Some("http://srv/wpad.dat"));
        let dhcp = OneShot::new("wpad_dhcp", Some("http://dhcp/wpad.dat"));
        let providers: Vec<Arc<dyn DiscoveryProvider>> = vec![srv.clone(), dhcp.clone()];
        let chain = WpadChain::new(providers, &PriorityTable::default());

        chain.rewind();
        assert_eq!(
            chain.next().expect("dhcp location").as_str(),
            "http://dhcp/wpad.dat"
        );
        assert_eq!(srv.asked.load(Ordering::SeqCst), 0);
        assert_eq!(
            chain.next().expect("srv location").as_str(),
            "http://srv/wpad.dat"
        );
        assert!(chain.next().is_none());
        assert!(chain.found());
    }

    #[test]
    fn skips_empty_providers_and_stays_exhausted_until_rewind() {
        let empty = OneShot::new("wpad_slp", None);
        let alias = OneShot::new("wpad_dns_alias", Some("http://wpad/wpad.dat"));
        let providers: Vec<Arc<dyn DiscoveryProvider>> = vec![alias.clone(), empty.clone()];
        let chain = WpadChain::new(providers, &PriorityTable::default());

        assert!(chain.next().is_some());
        assert!(chain.next().is_none());
        assert!(chain.next().is_none());
        assert_eq!(alias.asked.load(Ordering::SeqCst), 1);

        chain.rewind();
        assert!(!chain.found());
        assert_eq!(empty.rewound.load(Ordering::SeqCst), 1);
        assert!(chain.next().is_some());
        assert_eq!(alias.asked.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_ids_sort_last_in_registration_order() {
        let first = OneShot::new("custom_a", None);
        let second = OneShot::new("custom_b", None);
        let txt = OneShot::new("wpad_dns_txt", None);
        let providers: Vec<Arc<dyn DiscoveryProvider>> = vec![first, second, txt];
        let chain = WpadChain::new(providers, &PriorityTable::default());
        assert_eq!(
            chain.provider_ids(),
            vec!["wpad_dns_txt", "custom_a", "custom_b"]
        );
        assert!(chain.next().is_none());
        assert!(!chain.found());
    }

    #[test]
    fn rejected_locations_are_retried_on_the_same_provider_within_bounds() {
        let stuck = OneShot::new("wpad_dhcp", Some("http://stuck/wpad.dat"));
        let alias = OneShot::new("wpad_dns_alias", Some("http://wpad/wpad.dat"));
        let providers: Vec<Arc<dyn DiscoveryProvider>> = vec![alias.clone(), stuck.clone()];
        let chain = WpadChain::new(providers, &PriorityTable::default());

        let (location, host) = chain
            .next_loaded(|location| {
                location
                    .host_str()
                    .filter(|host| *host == "wpad")
                    .map(str::to_string)
            })
            .expect("alias location should be accepted");
        assert_eq!(location.as_str(), "http://wpad/wpad.dat");
        assert_eq!(host, "wpad");
        assert_eq!(stuck.asked.load(Ordering::SeqCst), MAX_LOCATIONS_PER_PROVIDER);
        assert_eq!(alias.asked.load(Ordering::SeqCst), 1);
        assert!(chain.next_loaded(|_| Some(())).is_none());
    }
}
