//! Registry of runs and the caller-facing API

use crate::action::{ActionStatus, BulkActionRequest};
use crate::config::BulkConfig;
use crate::error::{BulkError, RequestError, Result};
use crate::progress::ProgressSubscription;
use crate::runner::BulkActionRunner;
use crate::store::ShardedStoreClient;
use crate::summary::BulkActionSummaryOverview;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Owns every run and the store connections they target
pub struct BulkActionManager {
    config: BulkConfig,
    connections: RwLock<HashMap<String, Arc<dyn ShardedStoreClient>>>,
    runs: RwLock<HashMap<Uuid, Arc<BulkActionRunner>>>,
}

impl BulkActionManager {
    pub fn new(config: BulkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            connections: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
        })
    }

    /// Create a manager with a background reaper enforcing `retention`
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_reaper(config: BulkConfig) -> Result<Arc<Self>> {
        let manager = Arc::new(Self::new(config)?);
        manager.spawn_reaper(reap_interval(manager.config.retention));
        Ok(manager)
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    /// Make a store reachable under `name` for later requests
    pub fn register_connection(&self, name: &str, store: Arc<dyn ShardedStoreClient>) {
        debug!(connection = name, "Registered connection");
        self.connections.write().insert(name.to_string(), store);
    }

    /// Forget a connection; existing runs keep their store
    pub fn remove_connection(&self, name: &str) -> bool {
        self.connections.write().remove(name).is_some()
    }

    fn runner(&self, id: Uuid) -> Result<Arc<BulkActionRunner>> {
        self.runs
            .read()
            .get(&id)
            .cloned()
            .ok_or(BulkError::NotFound(id))
    }

    /// Validate `request` and allocate a run; every call makes a new run
    pub fn create(&self, request: BulkActionRequest) -> Result<Uuid> {
        request.validate()?;
        let store = self
            .connections
            .read()
            .get(&request.connection)
            .cloned()
            .ok_or_else(|| RequestError::UnknownConnection(request.connection.clone()))?;

        let runner = BulkActionRunner::new(request, self.config.clone(), store)?;
        let id = runner.id();
        self.runs.write().insert(id, runner);
        Ok(id)
    }

    /// Begin a created run
    pub fn start(&self, id: Uuid) -> Result<()> {
        self.runner(id)?.start()?;
        Ok(())
    }

    /// Request a cooperative stop; no-op for finished runs
    pub fn abort(&self, id: Uuid) -> Result<()> {
        self.runner(id)?.abort();
        Ok(())
    }

    /// Abort every unfinished run
    pub fn abort_all(&self) {
        let runs: Vec<_> = self.runs.read().values().cloned().collect();
        for runner in runs {
            runner.abort();
        }
    }

    /// Current state; per-key errors are handed out once
    pub fn get_overview(&self, id: Uuid) -> Result<BulkActionSummaryOverview> {
        Ok(self.runner(id)?.get_overview())
    }

    pub fn status(&self, id: Uuid) -> Result<ActionStatus> {
        Ok(self.runner(id)?.status())
    }

    /// Attach to a run's progress events
    pub fn subscribe(&self, id: Uuid) -> Result<ProgressSubscription> {
        Ok(self.runner(id)?.subscribe())
    }

    /// Detach a subscription
    pub fn unsubscribe(&self, subscription: ProgressSubscription) {
        debug!(run_id = %subscription.run_id(), "Unsubscribed");
        drop(subscription);
    }

    /// Wait for a run to finish and return its final overview
    ///
    /// Does not drain per-key errors.
    pub async fn wait(&self, id: Uuid) -> Result<BulkActionSummaryOverview> {
        let runner = self.runner(id)?;
        runner.wait().await;
        Ok(runner.snapshot())
    }

    /// Ids of every known run
    pub fn list(&self) -> Vec<Uuid> {
        self.runs.read().keys().copied().collect()
    }

    /// Drop terminal runs past retention with no subscribers
    ///
    /// Returns how many were removed.
    pub fn reap(&self) -> usize {
        let retention = self.config.retention;

        let mut runs = self.runs.write();
        let before = runs.len();
        runs.retain(|id, runner| {
            let expired = runner.status().is_terminal()
                && runner.finished_for().is_some_and(|age| age >= retention)
                && runner.subscriber_count() == 0;
            if expired {
                debug!(run_id = %id, "Reaping finished run");
            }
            !expired
        });

        let reaped = before - runs.len();
        if reaped > 0 {
            info!(reaped, remaining = runs.len(), "Reaped finished runs");
        }
        reaped
    }

    /// Reap periodically until the manager is dropped
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match manager.upgrade() {
                    Some(manager) => {
                        manager.reap();
                    }
                    None => break,
                }
            }
        })
    }
}

/// How often the reaper wakes for a given retention
fn reap_interval(retention: Duration) -> Duration {
    (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(60))
}
