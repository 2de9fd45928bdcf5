use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = marquee_common::id::prefixed_ulid("gw");
/// assert!(id.starts_with("gw_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const INSTANCE: &str = "gw";
}

/// Identity of one running gateway process.
///
/// Stamped into the `origin` field of every frame the process publishes so
/// that followers can tell their own traffic apart from other instances'.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn generate() -> Self {
        Self(prefixed_ulid(prefix::INSTANCE))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
