//! Store access for bulk actions
//!
//! The engine talks to the key-value store only through
//! [`ShardedStoreClient`]: list primaries, scan one page, apply one
//! pipelined batch. [`RedisStore`] speaks to a real deployment;
//! [`MemoryStore`] is an in-process stand-in with fault injection.
//!
//! ```text
//! ┌──────────────────────────┐
//! │    ShardedStoreClient     │
//! │  list_primary_nodes()     │
//! │  scan_page()              │
//! │  pipeline_apply()         │
//! └────────────┬─────────────┘
//!              │
//!     ┌────────┴────────┐
//!     ▼                 ▼
//! RedisStore        MemoryStore
//! (redis crate)     (tests)
//! ```

pub mod memory;
mod redis_store;
mod slot;

pub use memory::MemoryStore;
pub use redis_store::{parse_cluster_nodes, RedisStore};
pub use slot::{key_hash_slot, SlotRange, SLOT_COUNT};

use crate::action::KeyType;
use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Cursor value that starts a scan and signals its end
pub const CURSOR_START: &str = "0";

/// Check whether a cursor returned by a scan means "no more pages"
pub fn is_exhausted_cursor(cursor: &str) -> bool {
    cursor.is_empty() || cursor == CURSOR_START
}

/// One primary (write-owning) node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeHandle {
    /// Node id (cluster node id, or the address for a single node)
    pub id: String,
    /// host:port
    pub address: String,
    /// Owned hash slots; empty means the node owns the whole keyspace
    pub slots: Vec<SlotRange>,
}

impl NodeHandle {
    /// Handle for a single-node deployment
    pub fn standalone(address: &str) -> Self {
        Self {
            id: address.to_string(),
            address: address.to_string(),
            slots: Vec::new(),
        }
    }

    /// Check if this node owns `slot`
    pub fn owns_slot(&self, slot: u16) -> bool {
        self.slots.is_empty() || self.slots.iter().any(|r| r.contains(slot))
    }

    /// Check if this node owns `key`
    pub fn owns_key(&self, key: &str) -> bool {
        self.slots.is_empty() || self.owns_slot(key_hash_slot(key.as_bytes()))
    }
}

impl std::fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

/// A single command in a pipelined batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Delete(String),
    Unlink(String),
    Set {
        key: String,
        value: String,
        ttl_ms: Option<u64>,
    },
}

impl Mutation {
    /// Key this mutation targets
    pub fn key(&self) -> &str {
        match self {
            Mutation::Delete(key) | Mutation::Unlink(key) => key,
            Mutation::Set { key, .. } => key,
        }
    }
}

/// Per-key result of a pipelined batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOutcome {
    pub key: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl KeyOutcome {
    pub fn ok(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(key: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Capability the engine consumes from the connection layer
#[async_trait::async_trait]
pub trait ShardedStoreClient: Send + Sync {
    /// Enumerate primary nodes (one for a single-node deployment)
    async fn list_primary_nodes(&self) -> StoreResult<Vec<NodeHandle>>;

    /// Fetch one page of matching keys starting at `cursor`
    ///
    /// Returns the keys and the next cursor; an exhausted cursor
    /// (see [`is_exhausted_cursor`]) means the node is fully scanned.
    async fn scan_page(
        &self,
        node: &NodeHandle,
        cursor: &str,
        pattern: &str,
        key_type: Option<KeyType>,
        count: usize,
    ) -> StoreResult<(Vec<String>, String)>;

    /// Apply `mutations` in one round trip, returning one outcome per mutation
    /// in input order
    async fn pipeline_apply(
        &self,
        node: &NodeHandle,
        mutations: &[Mutation],
    ) -> StoreResult<Vec<KeyOutcome>>;
}

// Re-export async_trait for implementors
pub use async_trait::async_trait;

/// Run one store call under a deadline; expiry becomes [`StoreError::Timeout`]
pub async fn with_deadline<T, F>(limit: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            millis: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_cursor() {
        assert!(is_exhausted_cursor("0"));
        assert!(is_exhausted_cursor(""));
        assert!(!is_exhausted_cursor("1536"));
    }

    #[test]
    fn test_node_ownership() {
        let single = NodeHandle::standalone("127.0.0.1:6379");
        assert!(single.owns_key("anything"));

        let node = NodeHandle {
            id: "a".into(),
            address: "10.0.0.1:7000".into(),
            slots: vec![SlotRange::new(0, 5460)],
        };
        // "foo" hashes to 12182
        assert!(!node.owns_key("foo"));
        assert!(node.owns_slot(100));
    }

    #[test]
    fn test_mutation_key() {
        let m = Mutation::Set {
            key: "k".into(),
            value: "v".into(),
            ttl_ms: None,
        };
        assert_eq!(m.key(), "k");
        assert_eq!(Mutation::Unlink("x".into()).key(), "x");
    }

    #[tokio::test]
    async fn test_with_deadline() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, StoreError>(1)
        };
        let err = with_deadline(Duration::from_millis(10), slow)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Timeout { millis: 10 });

        let fast = async { Ok::<_, StoreError>(2) };
        assert_eq!(with_deadline(Duration::from_secs(1), fast).await, Ok(2));
    }
}
