//! Translation of `FindProxyForURL` results into candidate URLs.

use crate::config::candidate::DIRECT;

/// Translates a PAC result such as `PROXY a:8080; SOCKS b:1080; DIRECT`.
///
/// Unknown keywords and proxy entries without a host are dropped. The
/// returned list may be empty; callers decide the fallback.
pub fn parse_directives(raw: &str) -> Vec<String> {
    raw.split(';').filter_map(parse_entry).collect()
}

fn parse_entry(entry: &str) -> Option<String> {
    let mut parts = entry.split_whitespace();
    let keyword = parts.next()?.to_ascii_uppercase();
    let target = parts.next();

    let scheme = match keyword.as_str() {
        "DIRECT" => return Some(DIRECT.to_string()),
        "PROXY" | "HTTP" => "http",
        "HTTPS" => "https",
        "SOCKS" => "socks",
        "SOCKS4" => "socks4",
        "SOCKS5" => "socks5",
        _ => return None,
    };

    let target = target?.trim();
    if target.is_empty() {
        return None;
    }
    Some(format!("{scheme}://{target}"))
}

#[cfg(test)]
mod tests {
    use super::parse_directives;

    #[test]
    fn translates_every_known_keyword() {
        assert_eq!(
            parse_directives(
                "PROXY a:1; HTTP b:2;HTTPS c:3 ; SOCKS d:4; SOCKS4 e:5; SOCKS5 f:6; DIRECT"
            ),
            vec![
                "http://a:1",
                "http://b:2",
                "https://c:3",
                "socks://d:4",
                "socks4://e:5",
                "socks5://f:6",
                "direct://"
            ]
        );
    }

    #[test]
    fn drops_unknown_and_incomplete_entries() {
        assert_eq!(
            parse_directives("FTP x:21; PROXY; ; direct"),
            vec!["direct://"]
        );
        assert!(parse_directives("   ").is_empty());
    }
}
