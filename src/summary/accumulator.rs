//! Summary accumulator and the overview handed to callers

use crate::action::{ActionStatus, ActionType};
use crate::executor::PageResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// A key that failed within an otherwise successful page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyError {
    pub key: String,
    pub message: String,
}

/// Point-in-time copy of a summary's counters and capped lists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarySnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_keys_seen: u64,
    /// Newest first
    pub errors: Vec<KeyError>,
    /// Scan order
    pub sample_keys: Vec<String>,
}

impl SummarySnapshot {
    /// `processed == succeeded + failed`
    pub fn is_consistent(&self) -> bool {
        self.processed == self.succeeded + self.failed
    }
}

/// Running totals for one run
///
/// Owned by exactly one runner, which serialises every mutation behind its
/// own lock. A page is applied in one call to [`record_page`], so the
/// counters never show a half-applied page.
///
/// [`record_page`]: BulkActionSummary::record_page
#[derive(Debug)]
pub struct BulkActionSummary {
    processed: u64,
    succeeded: u64,
    failed: u64,
    total_keys_seen: u64,
    errors: VecDeque<KeyError>,
    sample_keys: Vec<String>,
    error_cap: usize,
    sample_cap: usize,
}

impl BulkActionSummary {
    pub fn new(error_cap: usize, sample_cap: usize) -> Self {
        Self {
            processed: 0,
            succeeded: 0,
            failed: 0,
            total_keys_seen: 0,
            errors: VecDeque::with_capacity(error_cap.min(64)),
            sample_keys: Vec::with_capacity(sample_cap.min(64)),
            error_cap,
            sample_cap,
        }
    }

    /// Fold one fully applied page into the totals
    pub fn record_page(&mut self, page: &PageResult) {
        for outcome in &page.outcomes {
            self.processed += 1;
            self.total_keys_seen += 1;

            if outcome.success {
                self.succeeded += 1;
            } else {
                self.failed += 1;
                self.push_error(KeyError {
                    key: outcome.key.clone(),
                    message: outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                });
            }

            if self.sample_keys.len() < self.sample_cap {
                self.sample_keys.push(outcome.key.clone());
            }
        }
    }

    fn push_error(&mut self, error: KeyError) {
        if self.error_cap == 0 {
            return;
        }
        if self.errors.len() == self.error_cap {
            self.errors.pop_back();
        }
        self.errors.push_front(error);
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Copy without side effects (progress events)
    pub fn snapshot(&self) -> SummarySnapshot {
        SummarySnapshot {
            processed: self.processed,
            succeeded: self.succeeded,
            failed: self.failed,
            total_keys_seen: self.total_keys_seen,
            errors: self.errors.iter().cloned().collect(),
            sample_keys: self.sample_keys.clone(),
        }
    }

    /// Copy that drains the buffered errors
    ///
    /// Errors are delivered at most once: a second call with no page in
    /// between returns the same counts and an empty error list.
    pub fn overview(&mut self) -> SummarySnapshot {
        SummarySnapshot {
            processed: self.processed,
            succeeded: self.succeeded,
            failed: self.failed,
            total_keys_seen: self.total_keys_seen,
            errors: self.errors.drain(..).collect(),
            sample_keys: self.sample_keys.clone(),
        }
    }
}

/// Shard completion counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardProgress {
    pub total: usize,
    pub done: usize,
}

impl ShardProgress {
    /// Fraction of shards finished, 0.0 when none are known yet
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}

/// What callers see for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkActionSummaryOverview {
    pub id: Uuid,
    pub action: ActionType,
    pub status: ActionStatus,
    #[serde(flatten)]
    pub summary: SummarySnapshot,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Milliseconds since start (until finish once terminal)
    pub duration_ms: u64,
    pub progress: ShardProgress,
    /// Reason for a Failed or Disconnected run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyOutcome;

    fn page(ok: &[&str], failed: &[&str]) -> PageResult {
        let mut outcomes: Vec<KeyOutcome> = ok.iter().map(|k| KeyOutcome::ok(*k)).collect();
        outcomes.extend(failed.iter().map(|k| KeyOutcome::failed(*k, "key not found")));
        PageResult { outcomes }
    }

    #[test]
    fn test_record_page_counts() {
        let mut summary = BulkActionSummary::new(500, 1000);
        summary.record_page(&page(&["a", "b"], &["c"]));

        let snap = summary.snapshot();
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.succeeded, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.total_keys_seen, 3);
        assert_eq!(snap.errors.len(), 1);
        assert_eq!(snap.errors[0].key, "c");
        assert!(snap.is_consistent());
    }

    #[test]
    fn test_errors_newest_first_and_capped() {
        let mut summary = BulkActionSummary::new(2, 10);
        summary.record_page(&page(&[], &["e1", "e2", "e3"]));

        let snap = summary.snapshot();
        assert_eq!(snap.failed, 3);
        let keys: Vec<_> = snap.errors.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["e3", "e2"]);
    }

    #[test]
    fn test_sample_cap_keeps_prefix() {
        let mut summary = BulkActionSummary::new(10, 2);
        summary.record_page(&page(&["k1", "k2", "k3"], &[]));
        summary.record_page(&page(&["k4"], &[]));

        let snap = summary.snapshot();
        assert_eq!(snap.sample_keys, vec!["k1".to_string(), "k2".to_string()]);
        assert_eq!(snap.total_keys_seen, 4);
        assert_eq!(snap.processed, 4);
    }

    #[test]
    fn test_overview_drains_errors_snapshot_does_not() {
        let mut summary = BulkActionSummary::new(10, 10);
        summary.record_page(&page(&["a"], &["b"]));

        assert_eq!(summary.snapshot().errors.len(), 1);
        assert_eq!(summary.snapshot().errors.len(), 1);

        let first = summary.overview();
        let second = summary.overview();
        assert_eq!(first.errors.len(), 1);
        assert!(second.errors.is_empty());
        assert_eq!(first.processed, second.processed);
        assert_eq!(first.failed, second.failed);
        assert_eq!(first.sample_keys, second.sample_keys);
    }

    #[test]
    fn test_zero_error_cap() {
        let mut summary = BulkActionSummary::new(0, 0);
        summary.record_page(&page(&[], &["x"]));
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.error_count(), 0);
    }

    #[test]
    fn test_shard_progress_ratio() {
        assert_eq!(ShardProgress::default().ratio(), 0.0);
        assert_eq!(ShardProgress { total: 4, done: 1 }.ratio(), 0.25);
    }
}
