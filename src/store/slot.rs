//! Cluster hash-slot routing

use serde::{Deserialize, Serialize};

/// Number of hash slots in a partitioned deployment
pub const SLOT_COUNT: u16 = 16384;

/// Inclusive range of hash slots owned by one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }
}

/// Hash slot of `key`, honouring `{hash tags}`
pub fn key_hash_slot(key: &[u8]) -> u16 {
    redis::cluster_routing::get_slot(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_slots() {
        assert_eq!(key_hash_slot(b"foo"), 12182);
        assert_eq!(key_hash_slot(b"bar"), 5061);
    }

    #[test]
    fn test_hash_tags() {
        assert_eq!(
            key_hash_slot(b"{user1000}.following"),
            key_hash_slot(b"{user1000}.followers")
        );
        assert_eq!(key_hash_slot(b"{user1000}.x"), key_hash_slot(b"user1000"));
        // Empty tag hashes the whole key
        assert_eq!(key_hash_slot(b"foo{}{bar}"), 8363);
    }

    #[test]
    fn test_slot_range() {
        let range = SlotRange::new(10, 20);
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(21));
    }
}
