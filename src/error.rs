//! Error types for keyspace-bulk
//!
//! The hierarchy mirrors the engine's failure taxonomy:
//! - Request validation errors (rejected before a run exists)
//! - Lookup and lifecycle errors (unknown run, wrong state)
//! - Topology errors (shard resolution failed)
//! - Batch errors (a whole page failed to scan or apply)
//!
//! Per-key failures are not errors at this level. They travel as
//! [`KeyOutcome`](crate::store::KeyOutcome) values and are absorbed into
//! the run summary.

use crate::action::ActionStatus;
use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for keyspace-bulk
#[derive(Error, Debug)]
pub enum BulkError {
    /// Malformed request
    #[error("Validation error: {0}")]
    Validation(#[from] RequestError),

    /// Unknown run id
    #[error("Bulk action '{0}' not found")]
    NotFound(Uuid),

    /// Operation not valid in the run's current lifecycle state
    #[error("Bulk action '{id}' is {status}, cannot {operation}")]
    InvalidState {
        id: Uuid,
        status: ActionStatus,
        operation: &'static str,
    },

    /// Shard resolution failed
    #[error("Topology error: {0}")]
    Topology(String),

    /// A whole page failed to scan or apply after retries
    #[error("Batch failed on node '{node}': {source}")]
    Batch {
        node: String,
        #[source]
        source: StoreError,
    },

    /// Store errors outside a page (connecting, topology probing)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors (seed files, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BulkError {
    /// Wrap a store error that took down a whole page on `node`
    pub fn batch(node: impl Into<String>, source: StoreError) -> Self {
        BulkError::Batch {
            node: node.into(),
            source,
        }
    }

    /// Check whether this error means the store connection is gone
    pub fn is_disconnect(&self) -> bool {
        match self {
            BulkError::Batch { source, .. } | BulkError::Store(source) => {
                matches!(source, StoreError::Disconnected(_))
            }
            _ => false,
        }
    }
}

/// Request validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Empty match pattern
    #[error("Key pattern must not be empty")]
    EmptyPattern,

    /// Zero scan count hint
    #[error("Scan count hint must be greater than zero")]
    ZeroCount,

    /// Missing connection reference
    #[error("Connection reference must not be empty")]
    MissingConnection,

    /// Connection reference not registered with the manager
    #[error("Unknown connection '{0}'")]
    UnknownConnection(String),

    /// Unknown key type name
    #[error("Unknown key type '{0}'")]
    UnknownKeyType(String),

    /// Unknown action name
    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    /// Upload without seed data
    #[error("Upload requires at least one seed entry")]
    EmptySeed,

    /// Seed data supplied to a non-upload action
    #[error("{action} does not accept seed entries")]
    UnexpectedSeed { action: String },

    /// Seed record with an empty key
    #[error("Seed entry {index} has an empty key")]
    EmptySeedKey { index: usize },

    /// Seed record with a zero TTL, which the store rejects
    #[error("Seed entry {index} has a zero TTL")]
    ZeroSeedTtl { index: usize },

    /// Unparseable seed record
    #[error("Seed line {line}: {reason}")]
    InvalidSeedLine { line: usize, reason: String },
}

/// Errors raised by a store client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection handle lost or closed
    #[error("Store connection lost: {0}")]
    Disconnected(String),

    /// Call exceeded its deadline
    #[error("Store call timed out after {millis}ms")]
    Timeout { millis: u64 },

    /// Server rejected a command
    #[error("Store command failed: {0}")]
    Command(String),

    /// Transport-level failure (reset, broken pipe)
    #[error("Store I/O failure: {0}")]
    Io(String),

    /// Node roles could not be determined
    #[error("Cannot determine node roles: {0}")]
    Topology(String),
}

impl StoreError {
    /// Check if a failed call may be attempted once more
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout { .. } | StoreError::Io(_) | StoreError::Command(_)
        )
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Disconnected(err.to_string())
        } else if err.is_timeout() {
            StoreError::Timeout { millis: 0 }
        } else if err.is_io_error() {
            StoreError::Io(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric option that must be positive was zero
    #[error("Invalid {name}: must be greater than zero")]
    Zero { name: &'static str },

    /// Minimum page size larger than the default page size
    #[error("Invalid min page size {min}: must not exceed page size {page_size}")]
    MinAbovePageSize { min: usize, page_size: usize },

    /// Invalid shard concurrency
    #[error("Invalid shard concurrency {count}: must be between 1 and {max}")]
    InvalidConcurrency { count: usize, max: usize },

    /// Invalid store URL
    #[error("Invalid store URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, BulkError>;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;
