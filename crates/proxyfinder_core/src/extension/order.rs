//! Priority tables used to order extensions.
//!
//! # Responsibility
//! - Parse comma-separated order policies (`PX_CONFIG_ORDER`, `PX_WPAD_ORDER`).
//! - Map an extension to a numeric rank; lower rank means higher priority.
//!
//! # Invariants
//! - Unknown extensions rank after every listed segment, never before.
//! - Segments are matched in table order; the first match decides the rank.

use crate::config::Tier;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const DEFAULT_CONFIG_ORDER: &str = "session,user,system,none";
pub const DEFAULT_WPAD_ORDER: &str = "dhcp,slp,dns_srv,dns_txt,dns_alias";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    EmptySegment { position: usize },
    EmptyTable,
}

impl Display for OrderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptySegment { position } => {
                write!(f, "order segment {position} is empty")
            }
            Self::EmptyTable => write!(f, "order table has no segments"),
        }
    }
}

impl Error for OrderError {}

fn split_segments(raw: &str) -> Result<Vec<String>, OrderError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(OrderError::EmptyTable);
    }
    trimmed
        .split(',')
        .enumerate()
        .map(|(position, segment)| {
            let segment = segment.trim();
            if segment.is_empty() {
                Err(OrderError::EmptySegment { position })
            } else {
                Ok(segment.to_ascii_lowercase())
            }
        })
        .collect()
}

/// Ordered list of id markers, e.g. the WPAD discovery order.
///
/// An extension ranks at the first marker contained in its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityTable {
    markers: Vec<String>,
}

impl PriorityTable {
    pub fn parse(raw: &str) -> Result<Self, OrderError> {
        Ok(Self {
            markers: split_segments(raw)?,
        })
    }

    pub fn wpad_default() -> Self {
        Self::from_markers(DEFAULT_WPAD_ORDER.split(','))
    }

    fn from_markers<'a>(markers: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            markers: markers.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    pub fn rank(&self, extension_id: &str) -> usize {
        let id = extension_id.to_ascii_lowercase();
        self.markers
            .iter()
            .position(|marker| id.contains(marker.as_str()))
            .unwrap_or(self.markers.len())
    }
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self::wpad_default()
    }
}

/// One segment of a config order policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderSegment {
    Tier(Tier),
    Provider(String),
}

impl OrderSegment {
    fn parse(segment: &str) -> Self {
        match Tier::parse(segment) {
            Ok(tier) => Self::Tier(tier),
            Err(_) => Self::Provider(segment.to_string()),
        }
    }

    fn matches(&self, tier: Tier, provider_id: &str) -> bool {
        match self {
            Self::Tier(expected) => *expected == tier,
            Self::Provider(marker) => provider_id.to_ascii_lowercase().contains(marker.as_str()),
        }
    }
}

/// Config provider arbitration policy.
///
/// Segments name either a tier (`session`, `user`, `system`, `none`) or a
/// provider id marker (`config_envvar`, `gnome`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOrder {
    segments: Vec<OrderSegment>,
}

impl ConfigOrder {
    pub fn parse(raw: &str) -> Result<Self, OrderError> {
        Ok(Self {
            segments: split_segments(raw)?
                .iter()
                .map(|segment| OrderSegment::parse(segment))
                .collect(),
        })
    }

    /// Places `overrides` ahead of the default tier order.
    pub fn with_overrides(overrides: &str) -> Result<Self, OrderError> {
        let mut order = Self::parse(overrides)?;
        order.segments.extend(Self::default().segments);
        Ok(order)
    }

    pub fn segments(&self) -> &[OrderSegment] {
        &self.segments
    }

    pub fn rank(&self, tier: Tier, provider_id: &str) -> usize {
        self.segments
            .iter()
            .position(|segment| segment.matches(tier, provider_id))
            .unwrap_or(self.segments.len())
    }
}

impl Default for ConfigOrder {
    fn default() -> Self {
        Self {
            segments: [Tier::Session, Tier::User, Tier::System, Tier::None]
                .into_iter()
                .map(OrderSegment::Tier)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigOrder, OrderError, OrderSegment, PriorityTable};
    use crate::config::Tier;

    #[test]
    fn default_config_order_ranks_session_first() {
        let order = ConfigOrder::default();
        assert!(order.rank(Tier::Session, "x") < order.rank(Tier::User, "x"));
        assert!(order.rank(Tier::User, "x") < order.rank(Tier::System, "x"));
        assert!(order.rank(Tier::System, "x") < order.rank(Tier::None, "x"));
    }

    #[test]
    fn overrides_by_provider_id_come_before_tiers() {
        let order = ConfigOrder::with_overrides("envvar").expect("override should parse");
        assert_eq!(order.rank(Tier::None, "config_envvar"), 0);
        assert!(order.rank(Tier::Session, "config_gnome") > 0);
        assert_eq!(
            order.segments()[0],
            OrderSegment::Provider("envvar".to_string())
        );
    }

    #[test]
    fn empty_segments_are_rejected() {
        assert_eq!(
            ConfigOrder::parse("session,,user").expect_err("empty segment must fail"),
            OrderError::EmptySegment { position: 1 }
        );
        assert_eq!(
            PriorityTable::parse("  ").expect_err("blank table must fail"),
            OrderError::EmptyTable
        );
    }

    #[test]
    fn wpad_table_matches_markers_inside_ids() {
        let table = PriorityTable::default();
        assert_eq!(table.rank("wpad_dhcp"), 0);
        assert_eq!(table.rank("wpad_dns_srv"), 2);
        assert_eq!(table.rank("wpad_dns_alias"), 4);
        assert_eq!(table.rank("wpad_custom"), 5);
    }
}
