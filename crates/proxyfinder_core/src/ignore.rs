//! Ignore (bypass) pattern matching.
//!
//! # Responsibility
//! - Decide whether a destination host/port matches one ignore pattern.
//! - Parse comma-separated ignore lists and apply them to target URLs.
//!
//! # Invariants
//! - Matching is pure and case-insensitive; no DNS lookups happen here.
//! - A pattern carrying a port only matches that exact port.
//!
//! Supported pattern forms, in evaluation order:
//! - `__simple_hostnames__` / `<local>`: host without a dot.
//! - `*`: every host.
//! - `example.com[:port]`: exact host.
//! - `.example.com[:port]`: strict suffix.
//! - `*.example.com[:port]`: glob suffix.
//! - `10.0.0.1`, `[::1]:8080`: IP literal.
//! - `10.0.0.0/8`, `10.0.0.0/255.0.0.0`, `fd00::/8`: network.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

pub const SIMPLE_HOSTNAMES: &str = "__simple_hostnames__";
const LOCAL_ALIAS: &str = "<local>";

/// Returns whether `host:port` matches `pattern`.
pub fn matches(host: &str, port: u16, pattern: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return false;
    }

    let host = normalize_host(host);
    if pattern.eq_ignore_ascii_case(SIMPLE_HOSTNAMES) || pattern.eq_ignore_ascii_case(LOCAL_ALIAS) {
        return host.parse::<IpAddr>().is_err() && !host.contains('.');
    }
    if pattern == "*" {
        return true;
    }

    if pattern.contains('/') {
        return network_matches(&host, pattern);
    }

    let (pattern_host, pattern_port) = split_port(pattern);
    if pattern_port.is_some_and(|expected| expected != port) {
        return false;
    }
    let pattern_host = normalize_host(pattern_host);
    if pattern_host.is_empty() {
        return false;
    }

    if let (Ok(target_ip), Ok(pattern_ip)) =
        (host.parse::<IpAddr>(), pattern_host.parse::<IpAddr>())
    {
        return target_ip == pattern_ip;
    }

    if host == pattern_host {
        return true;
    }
    if pattern_host.starts_with('.') {
        return host.ends_with(pattern_host.as_str());
    }
    if let Some(suffix) = pattern_host.strip_prefix('*') {
        return host.ends_with(suffix);
    }
    false
}

fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Splits `host:port`, `[v6]:port`. Bare IPv6 literals carry no port.
fn split_port(pattern: &str) -> (&str, Option<u16>) {
    if let Some(rest) = pattern.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':').and_then(|p| p.parse().ok())),
            None => (pattern, None),
        };
    }

    match pattern.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (pattern, None),
        },
        _ => (pattern, None),
    }
}

fn network_matches(host: &str, pattern: &str) -> bool {
    let Ok(target) = host.parse::<IpAddr>() else {
        return false;
    };
    let Some((network, mask)) = pattern.split_once('/') else {
        return false;
    };
    let Ok(network) = normalize_host(network).parse::<IpAddr>() else {
        return false;
    };
    let mask = mask.trim();

    let prefix_len = match (mask.parse::<u8>(), mask.parse::<Ipv4Addr>()) {
        (Ok(prefix_len), _) => prefix_len,
        (Err(_), Ok(netmask)) => match netmask_prefix_len(netmask) {
            Some(prefix_len) => prefix_len,
            None => return false,
        },
        _ => return false,
    };

    ip_in_subnet(target, network, prefix_len)
}

/// Contiguous dotted netmask to prefix length.
fn netmask_prefix_len(netmask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(netmask);
    let prefix_len = bits.leading_ones();
    if bits.checked_shl(prefix_len).unwrap_or(0) != 0 {
        return None;
    }
    u8::try_from(prefix_len).ok()
}

fn ip_in_subnet(ip: IpAddr, network: IpAddr, prefix_len: u8) -> bool {
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(network)) => ipv4_in_subnet(ip, network, prefix_len),
        (IpAddr::V6(ip), IpAddr::V6(network)) => ipv6_in_subnet(ip, network, prefix_len),
        _ => false,
    }
}

fn ipv4_in_subnet(ip: Ipv4Addr, network: Ipv4Addr, prefix_len: u8) -> bool {
    if prefix_len > 32 {
        return false;
    }
    if prefix_len == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - u32::from(prefix_len));
    (u32::from(ip) & mask) == (u32::from(network) & mask)
}

fn ipv6_in_subnet(ip: Ipv6Addr, network: Ipv6Addr, prefix_len: u8) -> bool {
    if prefix_len > 128 {
        return false;
    }
    if prefix_len == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - u32::from(prefix_len));
    (u128::from(ip) & mask) == (u128::from(network) & mask)
}

/// Parsed comma-separated ignore list.
///
/// A leading `-` inverts the list: every destination bypasses the proxy
/// except the ones matching a pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    patterns: Vec<String>,
    inverted: bool,
}

impl IgnoreList {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let (inverted, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };

        Self {
            patterns: body
                .split(',')
                .map(str::trim)
                .filter(|pattern| !pattern.is_empty())
                .map(str::to_string)
                .collect(),
            inverted,
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_inverted(&self) -> bool {
        self.inverted
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && !self.inverted
    }

    /// Whether `host:port` should bypass the proxy.
    pub fn bypasses_host(&self, host: &str, port: u16) -> bool {
        let hit = self
            .patterns
            .iter()
            .any(|pattern| matches(host, port, pattern));
        hit != self.inverted
    }

    /// Whether `target` should bypass the proxy. URLs without a host never do.
    pub fn bypasses(&self, target: &Url) -> bool {
        let host = match target.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return false,
        };
        let port = target.port_or_known_default().unwrap_or(0);
        self.bypasses_host(&host, port)
    }
}
