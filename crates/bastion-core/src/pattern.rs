//! Target-matching patterns.
//!
//! | Pattern      | Matches                                 |
//! |--------------|-----------------------------------------|
//! | `*`          | any target                              |
//! | `10.0.0.*`   | any target beginning with `10.0.0.`     |
//! | `10.0.0.5`   | exactly `10.0.0.5`                      |
//!
//! Shared by the policy store, the tunnel routing table and the agent's
//! allowlist.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetPattern {
    Any,
    Prefix(String),
    Exact(String),
}

impl TargetPattern {
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            TargetPattern::Any
        } else if let Some(prefix) = raw.strip_suffix('*') {
            TargetPattern::Prefix(prefix.to_string())
        } else {
            TargetPattern::Exact(raw.to_string())
        }
    }

    pub fn matches(&self, target: &str) -> bool {
        match self {
            TargetPattern::Any => true,
            TargetPattern::Prefix(prefix) => target.starts_with(prefix.as_str()),
            TargetPattern::Exact(exact) => target == exact,
        }
    }
}

impl fmt::Display for TargetPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPattern::Any => f.write_str("*"),
            TargetPattern::Prefix(prefix) => write!(f, "{prefix}*"),
            TargetPattern::Exact(exact) => f.write_str(exact),
        }
    }
}

impl Serialize for TargetPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TargetPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(TargetPattern::parse(&raw))
    }
}

/// First pattern in `patterns` matching `target`, in order.
pub fn first_match<'a>(patterns: &'a [TargetPattern], target: &str) -> Option<&'a TargetPattern> {
    patterns.iter().find(|p| p.matches(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_everything() {
        let p = TargetPattern::parse("*");
        assert_eq!(p, TargetPattern::Any);
        assert!(p.matches("10.0.0.5"));
        assert!(p.matches(""));
    }

    #[test]
    fn prefix_wildcard() {
        let p = TargetPattern::parse("10.0.0.*");
        assert!(p.matches("10.0.0.5"));
        assert!(p.matches("10.0.0.254:2222"));
        assert!(!p.matches("10.0.1.5"));
    }

    #[test]
    fn exact_requires_equality() {
        let p = TargetPattern::parse("10.0.0.5");
        assert!(p.matches("10.0.0.5"));
        assert!(!p.matches("10.0.0.50"));
        assert!(!p.matches("10.0.0.5:22"));
    }

    #[test]
    fn display_round_trips_source_text() {
        for raw in ["*", "db-*", "host.internal"] {
            assert_eq!(TargetPattern::parse(raw).to_string(), raw);
        }
    }

    #[test]
    fn first_match_respects_order() {
        let patterns = vec![TargetPattern::parse("10.*"), TargetPattern::parse("*")];
        assert_eq!(
            first_match(&patterns, "10.1.1.1"),
            Some(&TargetPattern::Prefix("10.".into()))
        );
        assert_eq!(first_match(&patterns, "192.168.0.1"), Some(&TargetPattern::Any));
        assert_eq!(first_match(&[], "x"), None);
    }
}
