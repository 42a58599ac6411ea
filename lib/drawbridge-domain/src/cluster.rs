use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Globally-unique cluster name. DNS-like, immutable after bootstrap.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
#[serde(transparent)]
pub struct ClusterName(String);

impl ClusterName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClusterName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ClusterName {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 253 {
            return Err(GatewayError::InvalidArgument(format!(
                "cluster name {s:?} must be 1-253 characters"
            )));
        }

        let valid_label = |label: &str| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        };

        if !s.split('.').all(valid_label) {
            return Err(GatewayError::InvalidArgument(format!(
                "cluster name {s:?} is not DNS-like"
            )));
        }

        Ok(Self(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dns_like_names() {
        for name in ["root", "leaf.example.com", "us-east-1", "a_b.c"] {
            assert!(name.parse::<ClusterName>().is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_malformed_names() {
        for name in ["", "-leading", "trailing-", "two..dots", "sp ace"] {
            assert!(name.parse::<ClusterName>().is_err(), "{name:?}");
        }
    }
}
