//! Bounded-memory result accumulation
//!
//! Scalar counters grow without limit; the error list and key sample are
//! capped, so memory use does not depend on keyspace size.

mod accumulator;

pub use accumulator::{
    BulkActionSummary, BulkActionSummaryOverview, KeyError, ShardProgress, SummarySnapshot,
};
