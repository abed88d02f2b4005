use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque action input/output.
///
/// The coordination core never inspects payload contents; hosting processes
/// choose their own serialization format.
pub type Payload = bytes::Bytes;

/// Identifier of one execution of an action.
///
/// Instance ids come from an atomic per-action counter, so the first instance
/// of an action is `1` and every later one is strictly greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(i64);

impl InstanceId {
    /// Creates an instance id from a raw counter value.
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw counter value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when an instance id cannot be parsed from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid instance id: {0:?}")]
pub struct ParseInstanceIdError(String);

impl FromStr for InstanceId {
    type Err = ParseInstanceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|_| ParseInstanceIdError(s.to_string()))
    }
}

impl From<i64> for InstanceId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<InstanceId> for i64 {
    fn from(id: InstanceId) -> Self {
        id.0
    }
}
