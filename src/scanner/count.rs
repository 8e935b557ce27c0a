//! Read-only key counting across shards

use crate::action::KeyFilter;
use crate::config::BulkConfig;
use crate::error::Result;
use crate::scanner::KeyScanner;
use crate::shard::ShardResolver;
use crate::store::{NodeHandle, ShardedStoreClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Matching keys found on one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCount {
    pub node: NodeHandle,
    pub keys: u64,
    pub pages: u64,
}

/// Count keys matching `filter` on every shard without mutating anything
pub async fn count_keys(
    store: Arc<dyn ShardedStoreClient>,
    filter: &KeyFilter,
    config: &BulkConfig,
) -> Result<Vec<ShardCount>> {
    let shards = ShardResolver::resolve(store.as_ref(), config.per_call_timeout).await?;
    let mut counts = Vec::with_capacity(shards.len());

    for mut shard in shards {
        let mut scanner = KeyScanner::new(
            Arc::clone(&store),
            filter,
            config.page_size,
            config.min_page_size,
            config.per_call_timeout,
            config.page_retries,
        );

        let mut keys = 0u64;
        while let Some(page) = scanner.next_page(&mut shard).await? {
            keys += page.len() as u64;
        }

        info!(shard = %shard.node, keys, pages = shard.pages, "Counted shard");
        counts.push(ShardCount {
            node: shard.node,
            keys,
            pages: shard.pages,
        });
    }

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_count_per_shard() {
        let store = Arc::new(MemoryStore::cluster(2));
        store.populate("user:", 40);
        store.populate("cache:", 10);

        let config = BulkConfig {
            page_size: 7,
            min_page_size: 1,
            ..Default::default()
        };
        let counts = count_keys(store.clone(), &KeyFilter::pattern("user:*"), &config)
            .await
            .unwrap();

        assert_eq!(counts.len(), 2);
        assert_eq!(counts.iter().map(|c| c.keys).sum::<u64>(), 40);
        assert_eq!(store.len(), 50);
        assert_eq!(store.apply_calls(), 0);
    }
}
