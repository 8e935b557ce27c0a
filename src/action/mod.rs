//! Bulk action request types and lifecycle states
//!
//! A request is the immutable input to a run: what to do, which keys to
//! touch, and which store connection to use.

mod types;

pub use types::{
    ActionStatus, ActionType, BulkActionRequest, KeyFilter, KeyType, SeedEntry,
    DEFAULT_PATTERN,
};
