//! Per-shard page fetching with adaptive COUNT

use crate::action::{KeyFilter, KeyType, SeedEntry};
use crate::error::{BulkError, Result};
use crate::shard::{Shard, ShardSource};
use crate::store::{is_exhausted_cursor, with_deadline, ShardedStoreClient, CURSOR_START};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Normal pages needed before the COUNT hint grows again
const GROW_AFTER_PAGES: u32 = 4;

/// One page of work for a shard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Keys in scan order
    pub keys: Vec<String>,
    /// Upload records for the keys (empty for scan shards)
    pub seed: Vec<SeedEntry>,
    /// Cursor after this page
    pub cursor: String,
}

impl ScanPage {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Pages through one shard
///
/// Holds the adaptive COUNT state, so use one scanner per shard.
pub struct KeyScanner {
    store: Arc<dyn ShardedStoreClient>,
    pattern: String,
    key_type: Option<KeyType>,
    page_size: usize,
    min_page_size: usize,
    hint: usize,
    normal_streak: u32,
    timeout: Duration,
    retries: u32,
}

impl KeyScanner {
    pub fn new(
        store: Arc<dyn ShardedStoreClient>,
        filter: &KeyFilter,
        page_size: usize,
        min_page_size: usize,
        timeout: Duration,
        retries: u32,
    ) -> Self {
        let page_size = filter.count.unwrap_or(page_size).max(1);
        let min_page_size = min_page_size.clamp(1, page_size);
        Self {
            store,
            pattern: filter.pattern.clone(),
            key_type: filter.key_type,
            page_size,
            min_page_size,
            hint: page_size,
            normal_streak: 0,
            timeout,
            retries,
        }
    }

    /// Current COUNT hint
    pub fn hint(&self) -> usize {
        self.hint
    }

    /// Fetch the next page, or `None` once the shard is exhausted
    ///
    /// One round trip per call. A page may be empty while the cursor is
    /// still live, so the caller reaches its abort check between pages.
    pub async fn next_page(&mut self, shard: &mut Shard) -> Result<Option<ScanPage>> {
        if shard.exhausted {
            return Ok(None);
        }

        if let ShardSource::Seed { .. } = shard.source {
            return Ok(self.next_seed_page(shard));
        }

        let (keys, next) = self.scan_with_retry(shard).await?;
        shard.pages += 1;
        self.adapt(keys.len());

        debug!(
            node = %shard.node,
            cursor = %shard.cursor,
            next = %next,
            keys = keys.len(),
            hint = self.hint,
            "Scanned page"
        );

        shard.exhausted = is_exhausted_cursor(&next);
        shard.cursor = if shard.exhausted {
            CURSOR_START.to_string()
        } else {
            next
        };

        if keys.is_empty() && shard.exhausted {
            return Ok(None);
        }

        Ok(Some(ScanPage {
            keys,
            seed: Vec::new(),
            cursor: shard.cursor.clone(),
        }))
    }

    fn next_seed_page(&mut self, shard: &mut Shard) -> Option<ScanPage> {
        let ShardSource::Seed { entries, offset } = &mut shard.source else {
            return None;
        };
        if *offset >= entries.len() {
            shard.exhausted = true;
            return None;
        }

        let end = (*offset + self.page_size).min(entries.len());
        let seed: Vec<SeedEntry> = entries[*offset..end].to_vec();
        *offset = end;

        shard.pages += 1;
        shard.exhausted = end == entries.len();
        shard.cursor = if shard.exhausted {
            CURSOR_START.to_string()
        } else {
            end.to_string()
        };

        Some(ScanPage {
            keys: seed.iter().map(|e| e.key.clone()).collect(),
            seed,
            cursor: shard.cursor.clone(),
        })
    }

    async fn scan_with_retry(&self, shard: &Shard) -> Result<(Vec<String>, String)> {
        let mut attempt = 0;
        loop {
            let call = self.store.scan_page(
                &shard.node,
                &shard.cursor,
                &self.pattern,
                self.key_type,
                self.hint,
            );
            match with_deadline(self.timeout, call).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        node = %shard.node,
                        cursor = %shard.cursor,
                        attempt,
                        error = %e,
                        "Scan failed, retrying"
                    );
                }
                Err(e) => return Err(BulkError::batch(shard.node.address.clone(), e)),
            }
        }
    }

    /// Shrink the hint after an oversized page, grow it back after a run of
    /// normal ones
    fn adapt(&mut self, returned: usize) {
        if returned > self.hint.saturating_mul(2) {
            let shrunk = (self.hint / 2).max(self.min_page_size);
            if shrunk != self.hint {
                warn!(returned, from = self.hint, to = shrunk, "Oversized page, shrinking scan count");
            }
            self.hint = shrunk;
            self.normal_streak = 0;
            return;
        }

        self.normal_streak += 1;
        if self.normal_streak >= GROW_AFTER_PAGES && self.hint < self.page_size {
            self.hint = self.hint.saturating_mul(2).min(self.page_size);
            self.normal_streak = 0;
        }
    }
}
