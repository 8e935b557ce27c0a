//! Broadcast-backed progress channel with snapshot replay

use crate::summary::BulkActionSummaryOverview;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

/// Events streamed to subscribers of a run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Current state, delivered first to every subscription and after a lag
    Snapshot(BulkActionSummaryOverview),
    /// The run entered Running
    ReportReady(BulkActionSummaryOverview),
    /// One page was applied
    ReportKeys {
        node: String,
        keys: Vec<String>,
        overview: BulkActionSummaryOverview,
    },
    /// The run reached a terminal state; sent once
    ReportComplete(BulkActionSummaryOverview),
}

impl ProgressEvent {
    pub fn overview(&self) -> &BulkActionSummaryOverview {
        match self {
            ProgressEvent::Snapshot(o)
            | ProgressEvent::ReportReady(o)
            | ProgressEvent::ReportComplete(o) => o,
            ProgressEvent::ReportKeys { overview, .. } => overview,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ProgressEvent::ReportComplete(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::Snapshot(_) => "snapshot",
            ProgressEvent::ReportReady(_) => "ready",
            ProgressEvent::ReportKeys { .. } => "keys",
            ProgressEvent::ReportComplete(_) => "complete",
        }
    }
}

/// Pub/sub relay scoped to one run
pub struct ProgressChannel {
    id: Uuid,
    sender: broadcast::Sender<ProgressEvent>,
    /// Latest known state; also the final state once complete
    latest: RwLock<BulkActionSummaryOverview>,
    completed: AtomicBool,
    subscribers: AtomicUsize,
}

impl ProgressChannel {
    pub fn new(capacity: usize, initial: BulkActionSummaryOverview) -> Arc<Self> {
        let (sender, _rx) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            id: initial.id,
            sender,
            latest: RwLock::new(initial),
            completed: AtomicBool::new(false),
            subscribers: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Record the current state without emitting an event
    pub fn update(&self, overview: BulkActionSummaryOverview) {
        if self.is_complete() {
            return;
        }
        *self.latest.write() = overview;
    }

    /// Publish a non-terminal event
    ///
    /// Ignored once the channel is complete. Use [`complete`](Self::complete)
    /// for the terminal event.
    pub fn publish(&self, event: ProgressEvent) {
        if event.is_complete() {
            self.complete(event.overview().clone());
            return;
        }

        let mut latest = self.latest.write();
        if self.is_complete() {
            return;
        }
        *latest = event.overview().clone();
        // No receivers is not an error
        let _ = self.sender.send(event);
    }

    /// Publish the terminal event; returns false if it was already sent
    pub fn complete(&self, overview: BulkActionSummaryOverview) -> bool {
        let mut latest = self.latest.write();
        if self
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        debug!(run_id = %self.id, status = %overview.status, "Publishing completion");
        *latest = overview.clone();
        let _ = self.sender.send(ProgressEvent::ReportComplete(overview));
        true
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Copy of the latest state
    pub fn latest(&self) -> BulkActionSummaryOverview {
        self.latest.read().clone()
    }

    /// Live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// Attach a subscriber
    ///
    /// The first event is a snapshot of the current state, or the terminal
    /// event if the run already finished.
    pub fn subscribe(self: &Arc<Self>) -> ProgressSubscription {
        // Holding the lock keeps the replay and the receiver consistent
        let latest = self.latest.read();
        let receiver = self.sender.subscribe();
        let pending = if self.is_complete() {
            ProgressEvent::ReportComplete(latest.clone())
        } else {
            ProgressEvent::Snapshot(latest.clone())
        };
        drop(latest);

        let count = self.subscribers.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(run_id = %self.id, subscribers = count, "Subscriber attached");

        ProgressSubscription {
            channel: Arc::clone(self),
            receiver,
            pending: Some(pending),
            finished: false,
        }
    }

    fn resync_event(&self) -> ProgressEvent {
        let latest = self.latest.read();
        if self.is_complete() {
            ProgressEvent::ReportComplete(latest.clone())
        } else {
            ProgressEvent::Snapshot(latest.clone())
        }
    }
}

/// One subscriber's view of a run's events
///
/// Ends after the terminal event. Dropping it detaches the subscriber.
pub struct ProgressSubscription {
    channel: Arc<ProgressChannel>,
    receiver: broadcast::Receiver<ProgressEvent>,
    pending: Option<ProgressEvent>,
    finished: bool,
}

impl ProgressSubscription {
    /// Run this subscription belongs to
    pub fn run_id(&self) -> Uuid {
        self.channel.id()
    }

    /// Next event, or `None` after the terminal event
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }

        if let Some(event) = self.pending.take() {
            self.finished = event.is_complete();
            return Some(event);
        }

        let event = match self.receiver.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(run_id = %self.channel.id(), skipped, "Progress subscriber lagged, resyncing");
                self.channel.resync_event()
            }
            Err(RecvError::Closed) => self.channel.resync_event(),
        };

        self.finished = event.is_complete();
        Some(event)
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        let left = self.channel.subscribers.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(run_id = %self.channel.id(), subscribers = left, "Subscriber detached");
    }
}
