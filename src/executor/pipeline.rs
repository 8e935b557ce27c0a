//! Chunked pipeline execution with remainder-only retry

use crate::action::ActionType;
use crate::error::{BulkError, Result, StoreError, StoreResult};
use crate::scanner::ScanPage;
use crate::store::{with_deadline, KeyOutcome, Mutation, NodeHandle, ShardedStoreClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-key outcomes of one applied page, in page order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResult {
    pub outcomes: Vec<KeyOutcome>,
}

impl PageResult {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().map(|o| o.key.as_str())
    }
}

/// Applies an action to pages of keys
pub struct ActionExecutor {
    store: Arc<dyn ShardedStoreClient>,
    chunk_size: usize,
    timeout: Duration,
    retries: u32,
}

impl ActionExecutor {
    pub fn new(
        store: Arc<dyn ShardedStoreClient>,
        chunk_size: usize,
        timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
            timeout,
            retries,
        }
    }

    /// Commands for `action` over `page`
    pub fn mutations(action: ActionType, page: &ScanPage) -> Vec<Mutation> {
        match action {
            ActionType::Delete => page.keys.iter().cloned().map(Mutation::Delete).collect(),
            ActionType::Unlink => page.keys.iter().cloned().map(Mutation::Unlink).collect(),
            ActionType::Upload => page
                .seed
                .iter()
                .map(|e| Mutation::Set {
                    key: e.key.clone(),
                    value: e.value.clone(),
                    ttl_ms: e.ttl_ms,
                })
                .collect(),
        }
    }

    /// Apply `action` to every key of `page` on `node`
    ///
    /// Per-key failures come back as outcomes. A whole-chunk failure is
    /// retried for the chunks that have not gone through; if that fails too
    /// the page fails with [`BulkError::Batch`]. A timed-out chunk may have
    /// been applied, so it is only resent for idempotent actions.
    pub async fn apply(
        &self,
        node: &NodeHandle,
        action: ActionType,
        page: &ScanPage,
    ) -> Result<PageResult> {
        let mutations = Self::mutations(action, page);
        if mutations.is_empty() {
            return Ok(PageResult::default());
        }

        let chunks: Vec<&[Mutation]> = mutations.chunks(self.chunk_size).collect();
        let mut done: Vec<Option<Vec<KeyOutcome>>> = vec![None; chunks.len()];
        let mut attempt = 0;

        loop {
            let failure = self.apply_pending(node, &chunks, &mut done).await;

            let Some((index, err)) = failure else {
                break;
            };

            let ambiguous = matches!(err, StoreError::Timeout { .. });
            if matches!(err, StoreError::Disconnected(_))
                || !err.is_retryable()
                || (ambiguous && !action.is_idempotent())
                || attempt >= self.retries
            {
                return Err(BulkError::batch(node.address.clone(), err));
            }

            attempt += 1;
            let pending = done.iter().filter(|d| d.is_none()).count();
            warn!(
                node = %node,
                chunk = index,
                pending,
                attempt,
                error = %err,
                "Pipeline failed, retrying unapplied chunks"
            );
        }

        let outcomes = done.into_iter().flatten().flatten().collect();
        Ok(PageResult { outcomes })
    }

    /// Send every chunk without a result; stop at the first failure
    async fn apply_pending(
        &self,
        node: &NodeHandle,
        chunks: &[&[Mutation]],
        done: &mut [Option<Vec<KeyOutcome>>],
    ) -> Option<(usize, StoreError)> {
        for (index, chunk) in chunks.iter().enumerate() {
            if done[index].is_some() {
                continue;
            }
            match self.apply_chunk(node, chunk).await {
                Ok(outcomes) => {
                    debug!(node = %node, chunk = index, commands = chunk.len(), "Applied chunk");
                    done[index] = Some(outcomes);
                }
                Err(e) => return Some((index, e)),
            }
        }
        None
    }

    async fn apply_chunk(&self, node: &NodeHandle, chunk: &[Mutation]) -> StoreResult<Vec<KeyOutcome>> {
        let outcomes = with_deadline(self.timeout, self.store.pipeline_apply(node, chunk)).await?;
        if outcomes.len() != chunk.len() {
            return Err(StoreError::Command(format!(
                "pipeline returned {} replies for {} commands",
                outcomes.len(),
                chunk.len()
            )));
        }
        Ok(outcomes)
    }
}
