//! Cursor-based paging over one shard
//!
//! ```text
//!   cursor "0" ──SCAN──▶ page 1 ──SCAN──▶ page 2 ── ... ──▶ cursor "0"
//!                 │                │
//!                 ▼                ▼
//!            ActionExecutor   ActionExecutor
//! ```
//!
//! The COUNT hint adapts per shard: oversized pages halve it, a run of
//! normal pages doubles it back toward the configured page size.

mod count;
mod key_scanner;

pub use count::{count_keys, ShardCount};
pub use key_scanner::{KeyScanner, ScanPage};
