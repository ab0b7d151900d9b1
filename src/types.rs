//! Shared primitive IDs, scalar values, and network enums.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Durable queue record identifier, assigned by the backing store.
pub type RecordId = u64;
/// Per-install monotonic sequence number stamped on every record.
pub type SeqNo = u64;
/// Application-level user identifier.
pub type UserId = String;

/// Event ids starting with this prefix are reserved for SDK-internal events.
pub const RESERVED_EVENT_PREFIX: &str = "da";

/// Attribute map attached to events and profile mutations.
///
/// Ordered so the same record always serializes to the same bytes.
pub type Attributes = BTreeMap<String, Scalar>;

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Absent / null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Numeric value; must be finite.
    Number(f64),
    /// Text value.
    String(String),
}

impl Scalar {
    /// Returns false for NaN and infinite numbers, which the wire format cannot carry.
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Number(v) => v.is_finite(),
            _ => true,
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<u32> for Scalar {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

/// Session identifier minted on each background-to-foreground transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Mints a fresh random session id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrowed string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Geographic position attached to an event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

/// Connectivity class reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// Wi-Fi or other unmetered link.
    Wifi,
    /// Metered mobile data.
    Cellular,
    /// No connectivity.
    None,
}
