//! Bulk action orchestration
//!
//! # Lifecycle
//!
//! ```text
//!  Initializing ─▶ Initialized ─start─▶ Preparing ─▶ Ready ─▶ Running
//!                       │                  │          │         │
//!                       │ abort            ├─▶ Completed (no shards)
//!                       ▼                  ▼          ▼         ▼
//!                    Aborted            Failed / Aborted   Completed / Failed / Aborted
//!
//!  Disconnected: from any non-terminal state when the store connection is lost
//! ```
//!
//! # Execution
//!
//! ```text
//!   ShardResolver ──▶ [shard 1] [shard 2] ... [shard N]
//!                         │
//!                         ▼  (per shard, abort checked before scan and apply)
//!              KeyScanner ──page──▶ ActionExecutor ──PageResult──▶ summary
//!                                                                   │
//!                                                                   ▼
//!                                                           ProgressChannel
//! ```
//!
//! Shards run one at a time by default, or in a bounded worker pool when
//! `shard_concurrency > 1`. Summary updates always go through one lock.

mod manager;
mod run;

pub use manager::BulkActionManager;
pub use run::BulkActionRunner;
