//! Request and lifecycle data structures

use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::str::FromStr;

use crate::error::RequestError;

/// Pattern used when a filter does not name one
pub const DEFAULT_PATTERN: &str = "*";

/// The mutation a run applies to every matched key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Synchronous delete (DEL)
    Delete,
    /// Non-blocking delete (UNLINK)
    Unlink,
    /// Seed keys from uploaded records (SET)
    Upload,
}

impl ActionType {
    /// Resending an idempotent action to a key it already hit is harmless
    pub fn is_idempotent(&self) -> bool {
        matches!(self, ActionType::Delete | ActionType::Unlink)
    }

    /// Whether keys come from scanning the store (vs. seed records)
    pub fn scans_keyspace(&self) -> bool {
        !matches!(self, ActionType::Upload)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Delete => write!(f, "delete"),
            ActionType::Unlink => write!(f, "unlink"),
            ActionType::Upload => write!(f, "upload"),
        }
    }
}

impl FromStr for ActionType {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delete" | "del" => Ok(ActionType::Delete),
            "unlink" => Ok(ActionType::Unlink),
            "upload" | "seed" => Ok(ActionType::Upload),
            other => Err(RequestError::UnknownAction(other.to_string())),
        }
    }
}

/// Data type restriction evaluated by the store during a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    String,
    List,
    Set,
    ZSet,
    Hash,
    Stream,
    Json,
    TimeSeries,
}

impl KeyType {
    /// Type name as reported by the store's TYPE command
    pub fn as_store_name(&self) -> &'static str {
        match self {
            KeyType::String => "string",
            KeyType::List => "list",
            KeyType::Set => "set",
            KeyType::ZSet => "zset",
            KeyType::Hash => "hash",
            KeyType::Stream => "stream",
            KeyType::Json => "ReJSON-RL",
            KeyType::TimeSeries => "TSDB-TYPE",
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_store_name())
    }
}

impl FromStr for KeyType {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" => Ok(KeyType::String),
            "list" => Ok(KeyType::List),
            "set" => Ok(KeyType::Set),
            "zset" => Ok(KeyType::ZSet),
            "hash" => Ok(KeyType::Hash),
            "stream" => Ok(KeyType::Stream),
            "json" | "rejson-rl" => Ok(KeyType::Json),
            "timeseries" | "tsdb-type" => Ok(KeyType::TimeSeries),
            other => Err(RequestError::UnknownKeyType(other.to_string())),
        }
    }
}

/// Which keys a run touches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFilter {
    /// Glob-style match pattern
    pub pattern: String,
    /// Optional data type restriction
    pub key_type: Option<KeyType>,
    /// Optional per-run scan count hint (overrides the configured page size)
    pub count: Option<usize>,
}

impl Default for KeyFilter {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_PATTERN.to_string(),
            key_type: None,
            count: None,
        }
    }
}

impl KeyFilter {
    /// Filter matching `pattern`
    pub fn pattern(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            ..Default::default()
        }
    }

    /// Restrict to one data type
    pub fn with_type(mut self, key_type: KeyType) -> Self {
        self.key_type = Some(key_type);
        self
    }

    /// Set the scan count hint
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }
}

/// One uploaded record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedEntry {
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl SeedEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl_ms: None,
        }
    }

    /// Read JSON-lines seed records, skipping blank lines and `#` comments
    pub fn read_json_lines<R: BufRead>(reader: R) -> crate::error::Result<Vec<SeedEntry>> {
        let mut entries = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let entry: SeedEntry =
                serde_json::from_str(trimmed).map_err(|e| RequestError::InvalidSeedLine {
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Immutable input to a bulk action run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkActionRequest {
    /// Mutation to apply
    pub action: ActionType,
    /// Key selection
    pub filter: KeyFilter,
    /// Opaque reference to the target store connection
    pub connection: String,
    /// Records to write (upload only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seed: Vec<SeedEntry>,
}

impl BulkActionRequest {
    /// Delete every key matching `filter`
    pub fn delete(connection: &str, filter: KeyFilter) -> Self {
        Self {
            action: ActionType::Delete,
            filter,
            connection: connection.to_string(),
            seed: Vec::new(),
        }
    }

    /// Unlink every key matching `filter`
    pub fn unlink(connection: &str, filter: KeyFilter) -> Self {
        Self {
            action: ActionType::Unlink,
            filter,
            connection: connection.to_string(),
            seed: Vec::new(),
        }
    }

    /// Write every seed record
    pub fn upload(connection: &str, seed: Vec<SeedEntry>) -> Self {
        Self {
            action: ActionType::Upload,
            filter: KeyFilter::default(),
            connection: connection.to_string(),
            seed,
        }
    }

    /// Reject malformed requests before any run state exists
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.connection.trim().is_empty() {
            return Err(RequestError::MissingConnection);
        }
        if self.filter.pattern.is_empty() {
            return Err(RequestError::EmptyPattern);
        }
        if self.filter.count == Some(0) {
            return Err(RequestError::ZeroCount);
        }

        match self.action {
            ActionType::Upload => {
                if self.seed.is_empty() {
                    return Err(RequestError::EmptySeed);
                }
                if let Some(index) = self.seed.iter().position(|e| e.key.is_empty()) {
                    return Err(RequestError::EmptySeedKey { index });
                }
                if let Some(index) = self.seed.iter().position(|e| e.ttl_ms == Some(0)) {
                    return Err(RequestError::ZeroSeedTtl { index });
                }
            }
            ActionType::Delete | ActionType::Unlink => {
                if !self.seed.is_empty() {
                    return Err(RequestError::UnexpectedSeed {
                        action: self.action.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// Request accepted, summary being allocated
    Initializing,
    /// Waiting for an explicit start
    Initialized,
    /// Resolving shards
    Preparing,
    /// Shards resolved, loop not yet begun
    Ready,
    /// Scanning and applying pages
    Running,
    /// Every shard exhausted
    Completed,
    /// Unrecoverable error; summary preserved
    Failed,
    /// Stopped on request at a page boundary
    Aborted,
    /// Store connection lost
    Disconnected,
}

impl ActionStatus {
    /// Terminal states are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed
                | ActionStatus::Failed
                | ActionStatus::Aborted
                | ActionStatus::Disconnected
        )
    }

    /// Legal edges of the lifecycle state machine
    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        use ActionStatus::*;

        if self.is_terminal() {
            return false;
        }
        if next == Disconnected {
            return true;
        }

        matches!(
            (*self, next),
            (Initializing, Initialized)
                | (Initialized, Preparing)
                | (Initialized, Aborted)
                | (Preparing, Ready)
                | (Preparing, Completed)
                | (Preparing, Failed)
                | (Preparing, Aborted)
                | (Ready, Running)
                | (Ready, Aborted)
                | (Ready, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Aborted)
        )
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionStatus::Initializing => "initializing",
            ActionStatus::Initialized => "initialized",
            ActionStatus::Preparing => "preparing",
            ActionStatus::Ready => "ready",
            ActionStatus::Running => "running",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Aborted => "aborted",
            ActionStatus::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}
