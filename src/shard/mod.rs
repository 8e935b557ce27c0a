//! Shard discovery
//!
//! A shard is one independently scannable partition: the whole keyspace
//! for a single node, or one primary node of a partitioned deployment.

mod resolver;

pub use resolver::{Shard, ShardResolver, ShardSource};
