//! DNS alias discovery: `http://wpad/wpad.dat`, then `wpad.<domain>` for
//! each parent of the local domain.

use super::DiscoveryProvider;
use crate::dns::{self, HostResolver};
use crate::extension::Extension;
use log::debug;
use std::sync::{Arc, Mutex};
use url::Url;

pub const DNS_ALIAS_PROVIDER_ID: &str = "wpad_dns_alias";

const WPAD_HOST: &str = "wpad";
const WPAD_PATH: &str = "/wpad.dat";

// Registrable-looking suffixes that belong to someone else.
const REFUSED_DOMAINS: &[&str] = &["co.uk", "com.au"];

pub struct DnsAliasDiscovery {
    resolver: Arc<dyn HostResolver>,
    candidates: Vec<Url>,
    cursor: Mutex<usize>,
}

impl DnsAliasDiscovery {
    /// Builds the candidate list for `domain` (the local DNS domain).
    pub fn new(resolver: Arc<dyn HostResolver>, domain: Option<&str>) -> Self {
        Self {
            resolver,
            candidates: candidate_locations(domain),
            cursor: Mutex::new(0),
        }
    }

    /// Uses the domain part of this machine's host name.
    pub fn from_system(resolver: Arc<dyn HostResolver>) -> Self {
        let domain = dns::local_domain();
        Self::new(resolver, domain.as_deref())
    }

    pub fn candidates(&self) -> &[Url] {
        &self.candidates
    }

    fn cursor(&self) -> std::sync::MutexGuard<'_, usize> {
        self.cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Parent domains of `domain`, longest first, stopping before a bare TLD or a
/// refused suffix.
fn devolve(domain: &str) -> Vec<String> {
    let mut domains = Vec::new();
    let mut current = domain.trim().trim_matches('.').to_ascii_lowercase();

    while current.contains('.') && !REFUSED_DOMAINS.contains(&current.as_str()) {
        domains.push(current.clone());
        current = match current.split_once('.') {
            Some((_, parent)) => parent.to_string(),
            None => break,
        };
    }
    domains
}

fn candidate_locations(domain: Option<&str>) -> Vec<Url> {
    std::iter::once(WPAD_HOST.to_string())
        .chain(
            domain
                .map(devolve)
                .unwrap_or_default()
                .into_iter()
                .map(|parent| format!("{WPAD_HOST}.{parent}")),
        )
        .filter_map(|host| Url::parse(&format!("http://{host}{WPAD_PATH}")).ok())
        .collect()
}

impl Extension for DnsAliasDiscovery {
    fn id(&self) -> &str {
        DNS_ALIAS_PROVIDER_ID
    }
}

impl DiscoveryProvider for DnsAliasDiscovery {
    fn next(&self) -> Option<Url> {
        let start = *self.cursor();
        for (index, candidate) in self.candidates.iter().enumerate().skip(start) {
            let host = candidate.host_str().unwrap_or_default();
            let resolved = self.resolver.resolve(host).is_some();
            debug!(
                "event=wpad_dns_alias module=wpad status={} host={}",
                if resolved { "ok" } else { "miss" },
                host
            );
            if resolved {
                *self.cursor() = index + 1;
                return Some(candidate.clone());
            }
        }
        *self.cursor() = self.candidates.len();
        None
    }

    fn rewind(&self) {
        *self.cursor() = 0;
    }
}
