//! keyspace-bulk - Bulk Actions over Sharded Key-Value Stores
//!
//! Mass delete, unlink and upload across an entire keyspace, which may be
//! partitioned over many primary nodes, with live progress and clean
//! cancellation.
//!
//! # Features
//!
//! - **Cursor-based scanning**: each shard is paged with SCAN, so no page
//!   ever holds a whole keyspace and other clients are not starved.
//!
//! - **Pipelined execution**: every page is applied in chunked round trips;
//!   per-key failures are recorded without stopping the page.
//!
//! - **Bounded memory**: counters are unbounded, the error list and key
//!   sample are capped.
//!
//! - **Cooperative abort**: a stop request is honoured between pages, so
//!   `processed == succeeded + failed` always holds.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      BulkActionManager                           │
//! │        create / start / abort / get_overview / subscribe         │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ one task per run
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      BulkActionRunner                            │
//! │  ┌─────────────┐    ┌─────────────┐    ┌────────────────┐        │
//! │  │ShardResolver│───▶│ KeyScanner  │───▶│ ActionExecutor │        │
//! │  │ primaries   │    │ SCAN pages  │    │ pipelined cmds │        │
//! │  └─────────────┘    └─────────────┘    └───────┬────────┘        │
//! │                                                │ PageResult      │
//! │                                                ▼                 │
//! │            ┌──────────────────────────┐   ┌──────────────────┐   │
//! │            │    BulkActionSummary     │──▶│ ProgressChannel  │   │
//! │            │  (single writer, capped) │   │   (broadcast)    │   │
//! │            └──────────────────────────┘   └──────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//!                    ┌──────────────────────┐
//!                    │  ShardedStoreClient   │
//!                    │ RedisStore / Memory   │
//!                    └──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # How many keys would be touched
//! keyspace-bulk count 'session:*'
//!
//! # Delete them, four shards at a time
//! keyspace-bulk -u redis://10.0.0.5:7000 delete 'session:*' -c 4
//!
//! # Seed keys from a JSON-lines file
//! keyspace-bulk upload seed.jsonl
//! ```

pub mod action;
pub mod config;
pub mod error;
pub mod executor;
pub mod progress;
pub mod report;
pub mod runner;
pub mod scanner;
pub mod shard;
pub mod store;
pub mod summary;

pub use action::{ActionStatus, ActionType, BulkActionRequest, KeyFilter, KeyType, SeedEntry};
pub use config::{BulkConfig, CliArgs};
pub use error::{BulkError, Result};
pub use progress::{ProgressEvent, ProgressSubscription};
pub use runner::{BulkActionManager, BulkActionRunner};
pub use store::{MemoryStore, RedisStore, ShardedStoreClient};
pub use summary::BulkActionSummaryOverview;
