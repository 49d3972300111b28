//! Candidate-URL grammar.
//!
//! A provider value is one of `direct://`, `wpad://`, `pac+<scheme>://...`,
//! or a whitespace-separated list of concrete proxy URLs
//! (`http://host:port`, `socks://host:port`, ...).

use url::Url;

pub const DIRECT: &str = "direct://";
pub const WPAD: &str = "wpad://";
const PAC_PREFIX: &str = "pac+";

/// How the factory must handle a provider's candidate value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Direct,
    Wpad,
    /// Script location with the `pac+` prefix removed.
    Pac(Url),
    Directives(Vec<String>),
}

impl Candidate {
    /// Classifies a raw candidate value.
    ///
    /// # Errors
    /// - Returns the URL parse error when a `pac+` location is malformed.
    pub fn classify(raw: &str) -> Result<Self, url::ParseError> {
        let trimmed = raw.trim();
        let lowered = trimmed.to_ascii_lowercase();

        if lowered.is_empty() || lowered == DIRECT {
            return Ok(Self::Direct);
        }
        if lowered == WPAD {
            return Ok(Self::Wpad);
        }
        if lowered.starts_with(PAC_PREFIX) {
            return Url::parse(&trimmed[PAC_PREFIX.len()..]).map(Self::Pac);
        }

        Ok(Self::Directives(
            trimmed.split_whitespace().map(str::to_string).collect(),
        ))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Wpad => "wpad",
            Self::Pac(_) => "pac",
            Self::Directives(_) => "directives",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Candidate;

    #[test]
    fn classifies_keywords_case_insensitively() {
        assert_eq!(Candidate::classify("direct://").expect("direct"), Candidate::Direct);
        assert_eq!(Candidate::classify(" WPAD:// ").expect("wpad"), Candidate::Wpad);
    }

    #[test]
    fn strips_pac_prefix() {
        let candidate = Candidate::classify("pac+http://config.example/proxy.pac")
            .expect("pac location should parse");
        match candidate {
            Candidate::Pac(url) => assert_eq!(url.as_str(), "http://config.example/proxy.pac"),
            other => panic!("expected pac candidate, got {other:?}"),
        }
        assert!(Candidate::classify("pac+").is_err());
    }

    #[test]
    fn other_values_are_directive_lists() {
        assert_eq!(
            Candidate::classify("http://proxy:3128  socks://fallback:1080").expect("directives"),
            Candidate::Directives(vec![
                "http://proxy:3128".to_string(),
                "socks://fallback:1080".to_string()
            ])
        );
    }
}
