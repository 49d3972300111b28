//! Configuration tiers used for provider arbitration.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Scope a config provider reads from.
///
/// Default arbitration order is `Session`, `User`, `System`, `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    None,
    User,
    System,
    Session,
}

/// Order-policy string value for the session tier.
pub const TIER_SESSION: &str = "session";
/// Order-policy string value for the user tier.
pub const TIER_USER: &str = "user";
/// Order-policy string value for the system tier.
pub const TIER_SYSTEM: &str = "system";
/// Order-policy string value for the tierless tier.
pub const TIER_NONE: &str = "none";

const SUPPORTED_TIER_STRINGS: &[&str] = &[TIER_SESSION, TIER_USER, TIER_SYSTEM, TIER_NONE];

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => TIER_NONE,
            Self::User => TIER_USER,
            Self::System => TIER_SYSTEM,
            Self::Session => TIER_SESSION,
        }
    }

    /// Parses a tier name, case-insensitively.
    pub fn parse(value: &str) -> Result<Self, TierError> {
        let normalized = value.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(TierError::Empty);
        }

        match normalized.as_str() {
            TIER_SESSION => Ok(Self::Session),
            TIER_USER => Ok(Self::User),
            TIER_SYSTEM => Ok(Self::System),
            TIER_NONE => Ok(Self::None),
            _ => Err(TierError::Unsupported(value.trim().to_string())),
        }
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns supported tier strings in default priority order.
pub fn supported_tier_strings() -> &'static [&'static str] {
    SUPPORTED_TIER_STRINGS
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierError {
    Empty,
    Unsupported(String),
}

impl Display for TierError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "tier value must not be empty"),
            Self::Unsupported(value) => write!(f, "tier is unsupported: {value}"),
        }
    }
}

impl Error for TierError {}
