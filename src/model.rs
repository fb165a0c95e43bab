//! # Data Model
//!
//! Core identifier types for occurrence key allocation: the stable integer
//! key, the result of a lookup or allocation, and the per-row allocation
//! status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable integer key for an occurrence record.
///
/// Keys are allocated once and never change for the lifetime of the record.
/// The wire form is a big-endian 4-byte signed integer; existing lookup
/// tables depend on that exact encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OccurrenceKey(pub i32);

impl OccurrenceKey {
    /// Encode as bytes for storage
    pub fn to_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Decode from bytes
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(i32::from_be_bytes(bytes))
    }

    /// Decode from a stored cell value, if it is a well-formed key.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 4] = bytes.try_into().ok()?;
        Some(Self::from_bytes(arr))
    }
}

impl fmt::Display for OccurrenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<OccurrenceKey> for i32 {
    fn from(key: OccurrenceKey) -> i32 {
        key.0
    }
}

impl From<i32> for OccurrenceKey {
    fn from(value: i32) -> OccurrenceKey {
        OccurrenceKey(value)
    }
}

/// Outcome of a key allocation or lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLookupResult {
    /// The occurrence key all lookup rows resolve to
    pub key: OccurrenceKey,
    /// Whether this call allocated the key (false = reused an existing one)
    pub created: bool,
}

impl KeyLookupResult {
    pub fn new(key: OccurrenceKey, created: bool) -> Self {
        Self { key, created }
    }
}

/// Per-row allocation state as observed during an attempt.
///
/// Only `Allocated` is ever persisted as a status string; `Allocating` is the
/// inferred state of a row whose lock is held but whose key is not yet final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Allocating,
    Allocated,
}

impl KeyStatus {
    /// The persisted string form. Existing tables hold `"ALLOCATED"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Allocating => "ALLOCATING",
            KeyStatus::Allocated => "ALLOCATED",
        }
    }

    /// Parse a persisted status cell.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        match raw {
            b"ALLOCATED" => Some(KeyStatus::Allocated),
            b"ALLOCATING" => Some(KeyStatus::Allocating),
            _ => None,
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_byte_round_trip() {
        let key = OccurrenceKey(123_456);
        assert_eq!(OccurrenceKey::from_bytes(key.to_bytes()), key);
        assert_eq!(key.to_bytes(), [0x00, 0x01, 0xE2, 0x40]);
    }

    #[test]
    fn test_key_from_slice_rejects_bad_width() {
        assert_eq!(OccurrenceKey::from_slice(&[0, 0, 1]), None);
        assert_eq!(
            OccurrenceKey::from_slice(&[0, 0, 0, 7]),
            Some(OccurrenceKey(7))
        );
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(KeyStatus::parse(b"ALLOCATED"), Some(KeyStatus::Allocated));
        assert_eq!(KeyStatus::parse(b"ALLOCATING"), Some(KeyStatus::Allocating));
        assert_eq!(KeyStatus::parse(b"garbage"), None);
    }
}
