//! One bulk action run and its state machine

use crate::action::{ActionStatus, BulkActionRequest};
use crate::config::BulkConfig;
use crate::error::{BulkError, Result, StoreError};
use crate::executor::{ActionExecutor, PageResult};
use crate::progress::{ProgressChannel, ProgressEvent, ProgressSubscription};
use crate::scanner::KeyScanner;
use crate::shard::{Shard, ShardResolver};
use crate::store::ShardedStoreClient;
use crate::summary::{BulkActionSummary, BulkActionSummaryOverview, ShardProgress, SummarySnapshot};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How a shard loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardEnd {
    Exhausted,
    Stopped,
}

/// A single bulk action
///
/// The runner is the only writer of its status and summary; everything
/// else reads copies.
pub struct BulkActionRunner {
    id: Uuid,
    request: BulkActionRequest,
    config: BulkConfig,
    store: Arc<dyn ShardedStoreClient>,
    status: RwLock<ActionStatus>,
    created_at: DateTime<Utc>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    finished_at: RwLock<Option<DateTime<Utc>>>,
    /// Monotonic finish time, used for retention
    finished: RwLock<Option<Instant>>,
    summary: Mutex<BulkActionSummary>,
    shards: Mutex<ShardProgress>,
    /// Cooperative stop requested by the caller
    abort: AtomicBool,
    /// Wakes a topology probe waiting on the store
    abort_signal: Notify,
    /// Stop requested by a failing worker
    halt: AtomicBool,
    error: RwLock<Option<String>>,
    channel: Arc<ProgressChannel>,
    terminal: watch::Sender<bool>,
}

impl BulkActionRunner {
    /// Validate `request` and allocate the run
    ///
    /// Fails without creating anything if the request is malformed.
    pub fn new(
        request: BulkActionRequest,
        config: BulkConfig,
        store: Arc<dyn ShardedStoreClient>,
    ) -> Result<Arc<Self>> {
        request.validate()?;

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let initial = BulkActionSummaryOverview {
            id,
            action: request.action,
            status: ActionStatus::Initializing,
            summary: SummarySnapshot::default(),
            created_at,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
            progress: ShardProgress::default(),
            error: None,
        };
        let channel = ProgressChannel::new(config.event_buffer, initial);
        let (terminal, _) = watch::channel(false);

        let runner = Arc::new(Self {
            id,
            summary: Mutex::new(BulkActionSummary::new(config.error_cap, config.sample_cap)),
            request,
            config,
            store,
            status: RwLock::new(ActionStatus::Initializing),
            created_at,
            started_at: RwLock::new(None),
            finished_at: RwLock::new(None),
            finished: RwLock::new(None),
            shards: Mutex::new(ShardProgress::default()),
            abort: AtomicBool::new(false),
            abort_signal: Notify::new(),
            halt: AtomicBool::new(false),
            error: RwLock::new(None),
            channel,
            terminal,
        });

        runner.transition(ActionStatus::Initialized);
        runner.channel.update(runner.snapshot());
        info!(
            run_id = %id,
            action = %runner.request.action,
            pattern = %runner.request.filter.pattern,
            connection = %runner.request.connection,
            "Bulk action created"
        );
        Ok(runner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> ActionStatus {
        *self.status.read()
    }

    /// Time since the run reached a terminal state
    pub fn finished_for(&self) -> Option<Duration> {
        self.finished.read().map(|at| at.elapsed())
    }

    /// Reason for a Failed or Disconnected run
    pub fn error(&self) -> Option<String> {
        self.error.read().clone()
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.channel.subscriber_count()
    }

    /// Move to `next` if the state machine allows it
    fn transition(&self, next: ActionStatus) -> bool {
        let mut status = self.status.write();
        self.apply_transition(&mut status, next)
    }

    /// Move to `next` only if the current status is `expected`
    fn transition_from(&self, expected: ActionStatus, next: ActionStatus) -> bool {
        let mut status = self.status.write();
        if *status != expected {
            return false;
        }
        self.apply_transition(&mut status, next)
    }

    fn apply_transition(&self, status: &mut ActionStatus, next: ActionStatus) -> bool {
        if !status.can_transition_to(next) {
            debug!(run_id = %self.id, from = %status, to = %next, "Ignoring transition");
            return false;
        }

        debug!(run_id = %self.id, from = %status, to = %next, "Status change");
        *status = next;

        let now = Utc::now();
        if next == ActionStatus::Preparing {
            *self.started_at.write() = Some(now);
        }
        if next.is_terminal() {
            *self.finished_at.write() = Some(now);
            *self.finished.write() = Some(Instant::now());
        }
        true
    }

    /// Begin the run on the tokio runtime
    ///
    /// Only valid from `Initialized`.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        if !self.transition_from(ActionStatus::Initialized, ActionStatus::Preparing) {
            return Err(BulkError::InvalidState {
                id: self.id,
                status: self.status(),
                operation: "start",
            });
        }

        info!(run_id = %self.id, "Bulk action started");
        self.channel.update(self.snapshot());

        let runner = Arc::clone(self);
        Ok(tokio::spawn(async move { runner.run().await }))
    }

    /// Request a cooperative stop
    ///
    /// No-op on a terminal run. A run that was never started is aborted
    /// immediately; a running one stops at its next checkpoint.
    pub fn abort(&self) {
        let status = self.status();
        if status.is_terminal() {
            debug!(run_id = %self.id, status = %status, "Abort ignored, run already finished");
            return;
        }

        self.abort.store(true, Ordering::SeqCst);
        self.abort_signal.notify_one();

        if self.transition_from(ActionStatus::Initialized, ActionStatus::Aborted) {
            info!(run_id = %self.id, "Bulk action aborted before start");
            self.publish_completion();
            return;
        }

        info!(run_id = %self.id, status = %self.status(), "Abort requested");
    }

    /// Current state; drains buffered per-key errors
    pub fn get_overview(&self) -> BulkActionSummaryOverview {
        let snapshot = self.summary.lock().overview();
        self.build_overview(snapshot)
    }

    /// Current state without draining errors
    pub fn snapshot(&self) -> BulkActionSummaryOverview {
        let snapshot = self.summary.lock().snapshot();
        self.build_overview(snapshot)
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        self.channel.subscribe()
    }

    /// Wait for a terminal state
    pub async fn wait(&self) -> ActionStatus {
        let mut rx = self.terminal.subscribe();
        // The sender lives as long as the runner, so this only ends at terminal
        let _ = rx.wait_for(|done| *done).await;
        self.status()
    }

    fn build_overview(&self, summary: SummarySnapshot) -> BulkActionSummaryOverview {
        let status = self.status();
        let started_at = *self.started_at.read();
        let finished_at = *self.finished_at.read();
        let duration_ms = match started_at {
            Some(start) => {
                let end = finished_at.unwrap_or_else(Utc::now);
                (end - start).num_milliseconds().max(0) as u64
            }
            None => 0,
        };

        BulkActionSummaryOverview {
            id: self.id,
            action: self.request.action,
            status,
            summary,
            created_at: self.created_at,
            started_at,
            finished_at,
            duration_ms,
            progress: *self.shards.lock(),
            error: self.error.read().clone(),
        }
    }

    async fn run(self: Arc<Self>) {
        let shards = match self.prepare().await {
            Ok(shards) => shards,
            Err(e) if self.is_abort_requested() => {
                info!(run_id = %self.id, error = %e, "Preparation failed after abort");
                self.finish(ActionStatus::Aborted);
                return;
            }
            Err(e) => {
                self.finish_with_error(e);
                return;
            }
        };

        if self.is_abort_requested() {
            self.finish(ActionStatus::Aborted);
            return;
        }

        if shards.is_empty() {
            info!(run_id = %self.id, "No shards to process");
            self.finish(ActionStatus::Completed);
            return;
        }

        if !self.transition(ActionStatus::Ready) || !self.transition(ActionStatus::Running) {
            return;
        }
        self.channel.publish(ProgressEvent::ReportReady(self.snapshot()));
        info!(
            run_id = %self.id,
            shards = shards.len(),
            concurrency = self.config.shard_concurrency,
            "Bulk action running"
        );

        let result = if self.config.shard_concurrency <= 1 || shards.len() == 1 {
            self.run_sequential(shards).await
        } else {
            Arc::clone(&self).run_pooled(shards).await
        };

        match result {
            Ok(ShardEnd::Exhausted) => self.finish(ActionStatus::Completed),
            Ok(ShardEnd::Stopped) => self.finish(ActionStatus::Aborted),
            Err(e) => self.finish_with_error(e),
        }
    }

    /// Resolve shards, routing upload records to their owners
    ///
    /// An abort while the probe is outstanding returns no shards at once.
    async fn prepare(&self) -> Result<Vec<Shard>> {
        let probe = ShardResolver::resolve(self.store.as_ref(), self.config.per_call_timeout);
        let shards = tokio::select! {
            shards = probe => shards?,
            _ = self.abort_signal.notified() => {
                debug!(run_id = %self.id, "Abort during topology probe");
                return Ok(Vec::new());
            }
        };
        let shards = if self.request.action.scans_keyspace() {
            shards
        } else {
            ShardResolver::partition_seed(shards, &self.request.seed)
        };

        self.shards.lock().total = shards.len();
        self.channel.update(self.snapshot());
        Ok(shards)
    }

    async fn run_sequential(&self, shards: Vec<Shard>) -> Result<ShardEnd> {
        for shard in shards {
            if self.run_shard(shard).await? == ShardEnd::Stopped {
                return Ok(ShardEnd::Stopped);
            }
        }
        Ok(ShardEnd::Exhausted)
    }

    /// Process shards with up to `shard_concurrency` workers
    async fn run_pooled(self: Arc<Self>, shards: Vec<Shard>) -> Result<ShardEnd> {
        let workers = self.config.shard_concurrency.min(shards.len());
        let queue = Arc::new(Mutex::new(shards.into_iter().collect::<VecDeque<_>>()));
        let mut set = JoinSet::new();

        for worker in 0..workers {
            let runner = Arc::clone(&self);
            let queue = Arc::clone(&queue);
            set.spawn(async move {
                loop {
                    let next = queue.lock().pop_front();
                    let Some(shard) = next else {
                        return Ok(ShardEnd::Exhausted);
                    };
                    debug!(run_id = %runner.id, worker, shard = %shard.node, "Worker took shard");
                    match runner.run_shard(shard).await {
                        Ok(ShardEnd::Exhausted) => continue,
                        Ok(ShardEnd::Stopped) => return Ok(ShardEnd::Stopped),
                        Err(e) => {
                            runner.halt.store(true, Ordering::SeqCst);
                            return Err(e);
                        }
                    }
                }
            });
        }

        let mut end = ShardEnd::Exhausted;
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(ShardEnd::Exhausted)) => {}
                Ok(Ok(ShardEnd::Stopped)) => end = ShardEnd::Stopped,
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    error!(run_id = %self.id, error = %join_err, "Shard worker panicked");
                    self.halt.store(true, Ordering::SeqCst);
                    if first_error.is_none() {
                        first_error = Some(BulkError::Store(StoreError::Command(format!(
                            "shard worker failed: {}",
                            join_err
                        ))));
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(end),
        }
    }

    fn should_stop(&self) -> bool {
        self.is_abort_requested() || self.halt.load(Ordering::SeqCst)
    }

    /// Scan and apply one shard until exhausted or stopped
    async fn run_shard(&self, mut shard: Shard) -> Result<ShardEnd> {
        let mut scanner = KeyScanner::new(
            Arc::clone(&self.store),
            &self.request.filter,
            self.config.page_size,
            self.config.min_page_size,
            self.config.per_call_timeout,
            self.config.page_retries,
        );
        let executor = ActionExecutor::new(
            Arc::clone(&self.store),
            self.config.pipeline_chunk,
            self.config.per_call_timeout,
            self.config.page_retries,
        );

        debug!(run_id = %self.id, shard = %shard.node, "Shard started");

        loop {
            if self.should_stop() {
                debug!(run_id = %self.id, shard = %shard.node, cursor = %shard.cursor, "Shard stopped before scan");
                return Ok(ShardEnd::Stopped);
            }

            let Some(page) = scanner.next_page(&mut shard).await? else {
                break;
            };
            if page.is_empty() {
                continue;
            }

            if self.should_stop() {
                debug!(run_id = %self.id, shard = %shard.node, keys = page.len(), "Shard stopped before apply");
                return Ok(ShardEnd::Stopped);
            }

            let result = executor
                .apply(&shard.node, self.request.action, &page)
                .await?;
            self.record(&shard, result);
        }

        self.shards.lock().done += 1;
        info!(run_id = %self.id, shard = %shard.node, pages = shard.pages, "Shard finished");
        Ok(ShardEnd::Exhausted)
    }

    /// Fold a page into the summary and announce it
    fn record(&self, shard: &Shard, result: PageResult) {
        let mut summary = self.summary.lock();
        summary.record_page(&result);
        let overview = self.build_overview(summary.snapshot());

        debug!(
            run_id = %self.id,
            shard = %shard.node,
            keys = result.len(),
            failed = result.failed(),
            processed = overview.summary.processed,
            "Page applied"
        );

        // Published under the summary lock so snapshots arrive in order
        self.channel.publish(ProgressEvent::ReportKeys {
            node: shard.node.address.clone(),
            keys: result.outcomes.into_iter().map(|o| o.key).collect(),
            overview,
        });
    }

    fn finish_with_error(&self, err: BulkError) {
        let status = if err.is_disconnect() {
            ActionStatus::Disconnected
        } else {
            ActionStatus::Failed
        };
        error!(run_id = %self.id, status = %status, error = %err, "Bulk action failed");
        *self.error.write() = Some(err.to_string());
        self.finish(status);
    }

    fn finish(&self, status: ActionStatus) {
        if !self.transition(status) {
            warn!(run_id = %self.id, status = %status, "Run already finished");
            return;
        }
        self.publish_completion();
    }

    fn publish_completion(&self) {
        let overview = self.snapshot();
        info!(
            run_id = %self.id,
            status = %overview.status,
            processed = overview.summary.processed,
            succeeded = overview.summary.succeeded,
            failed = overview.summary.failed,
            duration_ms = overview.duration_ms,
            "Bulk action finished"
        );
        self.channel.complete(overview);
        self.terminal.send_replace(true);
    }
}
