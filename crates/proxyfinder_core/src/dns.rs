//! Host resolution collaborator.
//!
//! # Responsibility
//! - Resolve host names for WPAD probing and the PAC `dnsResolve` /
//!   `myIpAddress` helpers.
//!
//! # Invariants
//! - Every lookup is bounded: `getaddrinfo` runs on a helper thread and the
//!   caller waits at most the configured timeout.
//! - IPv4 answers are preferred, since PAC scripts compare dotted quads.

use log::debug;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(2);

// Documentation range; connecting a UDP socket sends nothing.
const ROUTE_PROBE: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 53);

pub trait HostResolver: Send + Sync {
    /// First address for `host`, or `None` when it does not resolve in time.
    fn resolve(&self, host: &str) -> Option<IpAddr>;

    /// Address this machine uses for outbound traffic.
    fn local_address(&self) -> Option<IpAddr>;
}

/// `getaddrinfo`-backed resolver.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(DEFAULT_DNS_TIMEOUT)
    }
}

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> Option<IpAddr> {
        let host = host.trim().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        if let Ok(addr) = host.parse::<IpAddr>() {
            return Some(addr);
        }

        let started_at = Instant::now();
        let (sender, receiver) = mpsc::channel();
        let lookup_host = host.to_string();
        thread::spawn(move || {
            let answer = (lookup_host.as_str(), 0_u16)
                .to_socket_addrs()
                .ok()
                .and_then(|addrs| preferred_address(addrs.map(|addr| addr.ip())));
            // Receiver may have timed out already.
            let _ = sender.send(answer);
        });

        let answer = receiver.recv_timeout(self.timeout).ok().flatten();
        debug!(
            "event=dns_resolve module=dns status={} host={} duration_ms={}",
            if answer.is_some() { "ok" } else { "miss" },
            host,
            started_at.elapsed().as_millis()
        );
        answer
    }

    fn local_address(&self) -> Option<IpAddr> {
        let by_route = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .and_then(|socket| {
                socket.connect(ROUTE_PROBE)?;
                socket.local_addr()
            })
            .ok()
            .map(|addr| addr.ip())
            .filter(|ip| !ip.is_unspecified());
        if by_route.is_some() {
            return by_route;
        }

        local_hostname()
            .and_then(|name| self.resolve(&name))
            .or(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))
    }
}

fn preferred_address(addrs: impl Iterator<Item = IpAddr>) -> Option<IpAddr> {
    let mut fallback = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        fallback.get_or_insert(addr);
    }
    fallback
}

/// Host name of this machine as reported by the OS.
pub fn local_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .map(|name| name.trim().trim_end_matches('.').to_ascii_lowercase())
        .filter(|name| !name.is_empty())
}

/// DNS domain of this machine, derived from a fully qualified host name.
pub fn local_domain() -> Option<String> {
    local_hostname().and_then(|name| {
        name.split_once('.')
            .map(|(_, domain)| domain.to_string())
            .filter(|domain| !domain.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::{preferred_address, HostResolver, SystemResolver};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::time::Duration;

    #[test]
    fn literals_resolve_without_lookup() {
        let resolver = SystemResolver::new(Duration::from_millis(10));
        assert_eq!(
            resolver.resolve("10.0.0.7"),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)))
        );
        assert_eq!(
            resolver.resolve("[::1]"),
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
        assert_eq!(resolver.resolve("  "), None);
    }

    #[test]
    fn prefers_ipv4_answers() {
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(preferred_address([v6, v4].into_iter()), Some(v4));
        assert_eq!(preferred_address([v6].into_iter()), Some(v6));
        assert_eq!(preferred_address(std::iter::empty()), None);
    }

    #[test]
    fn local_address_always_answers() {
        assert!(SystemResolver::default().local_address().is_some());
    }
}
