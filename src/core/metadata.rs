//! Kind-specific mutation payloads.
//!
//! Metadata is a free-form key/value object, but its wire encoding must be
//! deterministic: the same payload always serializes to the same JSON
//! string, since that string is what gets hashed and written on chain.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Deterministic key/value payload attached to a mutation.
///
/// Keys are stored in a `BTreeMap`, so serialization order is stable
/// regardless of insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Canonical wire encoding.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse a metadata string read back from the ledger.
    ///
    /// The chain stores metadata as an opaque string; anything that is not a
    /// JSON object (including the empty string) maps to an empty payload, so
    /// a malformed on-chain entry never fails a history read.
    pub fn from_json_lossy(raw: &str) -> Self {
        match serde_json::from_str::<BTreeMap<String, Value>>(raw) {
            Ok(map) => Self(map),
            Err(_) => Self::default(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
