//! Core type definitions for farstore.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the reserved record id field.
pub const ID_FIELD: &str = "_id";
/// Name of the reserved creation-timestamp field.
pub const CREATED_FIELD: &str = "_created";
/// Name of the reserved update-timestamp field.
pub const UPDATED_FIELD: &str = "_updated";
/// Name of the reserved sequence-number field.
pub const SEQUENCE_FIELD: &str = "_seq";

/// Unique identifier for an entity.
///
/// Entity ids are opaque strings assigned by the server on the first
/// successful save. The client never generates them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Creates an entity id from a raw string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id, returning the raw string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Server-assigned sequence number for ordering saves within a collection.
///
/// Sequence numbers are monotonically increasing per collection. Higher
/// numbers indicate later first saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_display() {
        let id = EntityId::new("4f2d8c1e");
        assert_eq!(format!("{id}"), "4f2d8c1e");
        assert_eq!(id.as_str(), "4f2d8c1e");
    }

    #[test]
    fn sequence_number_ordering() {
        let a = SequenceNumber::new(1);
        let b = SequenceNumber::new(2);
        assert!(a < b);
        assert_eq!(format!("{a}"), "seq:1");
    }
}
