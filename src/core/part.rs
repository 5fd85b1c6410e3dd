//! Part identity.
//!
//! A part is identified everywhere (ledger, relayer, local indices) by a
//! stable 32-byte hash derived from its registration identity fields.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::{keccak256, B256};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartHashError {
    #[error("part hash must be a 0x-prefixed 32-byte hex string, got {got:?}")]
    Malformed { got: String },
}

/// Stable 32-byte identifier for one physical part.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartHash(B256);

impl PartHash {
    pub fn new(inner: B256) -> Self {
        Self(inner)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(B256::from(bytes))
    }

    /// Derive the hash for a newly registered part.
    ///
    /// The identity string joins the registration fields with `-`, so the
    /// same physical part always maps to the same hash regardless of which
    /// device registers it.
    pub fn generate(part_id: &str, vendor_id: &str, lot_id: &str, manufacture_ms: u64) -> Self {
        let identity = format!("{part_id}-{vendor_id}-{lot_id}-{manufacture_ms}");
        Self(keccak256(identity.as_bytes()))
    }

    pub fn parse(raw: &str) -> Result<Self, PartHashError> {
        let malformed = || PartHashError::Malformed {
            got: raw.to_string(),
        };
        let hex = raw.strip_prefix("0x").ok_or_else(malformed)?;
        if hex.len() != 64 {
            return Err(malformed());
        }
        B256::from_str(raw).map(Self).map_err(|_| malformed())
    }

    pub fn as_b256(&self) -> &B256 {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_ref()
    }

    /// Lowercase `0x`-prefixed form, the canonical wire and storage encoding.
    pub fn to_hex(&self) -> String {
        format!("{:#x}", self.0)
    }
}

impl fmt::Display for PartHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for PartHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartHash({:#x})", self.0)
    }
}

impl Serialize for PartHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PartHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PartHash::parse(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_deterministic() {
        let a = PartHash::generate("P-1", "V-1", "L-1", 1_700_000_000_000);
        let b = PartHash::generate("P-1", "V-1", "L-1", 1_700_000_000_000);
        let c = PartHash::generate("P-2", "V-1", "L-1", 1_700_000_000_000);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn parse_round_trips_hex() {
        let hash = PartHash::from_bytes([0xAA; 32]);
        let hex = hash.to_hex();
        assert!(hex.starts_with("0x"));
        assert_eq!(hex.len(), 66);
        assert_eq!(PartHash::parse(&hex).unwrap(), hash);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(PartHash::parse("deadbeef").is_err());
        assert!(PartHash::parse("0x1234").is_err());
        assert!(PartHash::parse(&format!("0x{}", "zz".repeat(32))).is_err());
    }
}
