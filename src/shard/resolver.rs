//! Resolve a store into the shards a run iterates

use crate::action::SeedEntry;
use crate::error::{BulkError, Result, StoreError};
use crate::store::{key_hash_slot, with_deadline, NodeHandle, ShardedStoreClient, CURSOR_START};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where a shard's keys come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardSource {
    /// Cursor scan of the node's keyspace
    Scan,
    /// Upload records routed to this node, consumed from `offset`
    Seed {
        entries: Vec<SeedEntry>,
        offset: usize,
    },
}

/// One scannable partition with its resumable cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub node: NodeHandle,
    pub cursor: String,
    pub exhausted: bool,
    /// Pages fetched so far
    pub pages: u64,
    pub source: ShardSource,
}

impl Shard {
    /// Fresh scan over `node`
    pub fn scan(node: NodeHandle) -> Self {
        Self {
            node,
            cursor: CURSOR_START.to_string(),
            exhausted: false,
            pages: 0,
            source: ShardSource::Scan,
        }
    }

    /// Shard that pages through `entries` instead of scanning
    pub fn seeded(node: NodeHandle, entries: Vec<SeedEntry>) -> Self {
        let exhausted = entries.is_empty();
        Self {
            node,
            cursor: CURSOR_START.to_string(),
            exhausted,
            pages: 0,
            source: ShardSource::Seed {
                entries,
                offset: 0,
            },
        }
    }

    /// Seed records not yet handed out (0 for scan shards)
    pub fn remaining_seed(&self) -> usize {
        match &self.source {
            ShardSource::Scan => 0,
            ShardSource::Seed { entries, offset } => entries.len().saturating_sub(*offset),
        }
    }
}

/// Turns a store's topology into shards
pub struct ShardResolver;

impl ShardResolver {
    /// One shard per primary node, probed under `timeout`
    ///
    /// A lost connection surfaces as a store error so the run can be marked
    /// disconnected; anything else, including a stalled probe, is a
    /// topology error.
    pub async fn resolve(store: &dyn ShardedStoreClient, timeout: Duration) -> Result<Vec<Shard>> {
        let probe = with_deadline(timeout, store.list_primary_nodes());
        let nodes = probe.await.map_err(|e| match e {
            StoreError::Disconnected(_) => BulkError::Store(e),
            other => BulkError::Topology(other.to_string()),
        })?;

        if nodes.is_empty() {
            warn!("Store reported no primary nodes");
        }

        for node in &nodes {
            debug!(node = %node, id = %node.id, ranges = node.slots.len(), "Resolved primary");
        }
        info!(shards = nodes.len(), "Resolved shards");

        Ok(nodes.into_iter().map(Shard::scan).collect())
    }

    /// Route upload records to the shard owning each key's hash slot
    ///
    /// Records whose slot no shard claims go to the first shard, where the
    /// store rejects them per key.
    pub fn partition_seed(shards: Vec<Shard>, seed: &[SeedEntry]) -> Vec<Shard> {
        let mut buckets: Vec<Vec<SeedEntry>> = vec![Vec::new(); shards.len()];
        if shards.is_empty() {
            return Vec::new();
        }

        for entry in seed {
            let slot = key_hash_slot(entry.key.as_bytes());
            let idx = shards
                .iter()
                .position(|s| s.node.owns_slot(slot))
                .unwrap_or(0);
            buckets[idx].push(entry.clone());
        }

        shards
            .into_iter()
            .zip(buckets)
            .map(|(shard, entries)| Shard::seeded(shard.node, entries))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_resolve_single_node() {
        let store = MemoryStore::single();
        let shards = ShardResolver::resolve(&store, PROBE_TIMEOUT).await.unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].cursor, CURSOR_START);
        assert!(!shards[0].exhausted);
    }

    #[tokio::test]
    async fn test_resolve_cluster() {
        let store = MemoryStore::cluster(3);
        let shards = ShardResolver::resolve(&store, PROBE_TIMEOUT).await.unwrap();
        assert_eq!(shards.len(), 3);
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let store = MemoryStore::single();
        store.fail_topology("node roles unknown");
        let err = ShardResolver::resolve(&store, PROBE_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, BulkError::Topology(_)));

        let store = MemoryStore::single();
        store.disconnect();
        let err = ShardResolver::resolve(&store, PROBE_TIMEOUT).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_probe_times_out() {
        let store = MemoryStore::single();
        store.set_topology_delay(Duration::from_secs(3600));
        let err = ShardResolver::resolve(&store, PROBE_TIMEOUT).await.unwrap_err();
        match err {
            BulkError::Topology(reason) => assert!(reason.contains("timed out")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_partition_seed_by_slot() {
        let store = MemoryStore::cluster(3);
        let shards = ShardResolver::resolve(&store, PROBE_TIMEOUT).await.unwrap();
        let seed = vec![
            SeedEntry::new("foo", "1"), // slot 12182
            SeedEntry::new("bar", "2"), // slot 5061
            SeedEntry::new("{foo}.x", "3"),
        ];

        let shards = ShardResolver::partition_seed(shards, &seed);
        assert_eq!(shards[0].remaining_seed(), 1);
        assert_eq!(shards[1].remaining_seed(), 0);
        assert!(shards[1].exhausted);
        assert_eq!(shards[2].remaining_seed(), 2);
    }
}
