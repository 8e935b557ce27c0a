//! Configuration types for keyspace-bulk
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Engine configuration with defaults and validation
//! - Store URL checking

use crate::action::{KeyFilter, KeyType, DEFAULT_PATTERN};
use crate::error::ConfigError;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum reasonable number of shards processed at once
const MAX_SHARD_CONCURRENCY: usize = 64;

/// Default store URL
pub const DEFAULT_URL: &str = "redis://127.0.0.1:6379";

/// Mass delete, unlink and upload over a key-value store
#[derive(Parser, Debug, Clone)]
#[command(
    name = "keyspace-bulk",
    version,
    about = "Mass delete, unlink and upload over a (possibly clustered) key-value store",
    long_about = "Scans every primary node with cursor-based SCAN and applies the action\n\
                  in pipelined batches, showing live progress.\n\n\
                  Ctrl-C requests a clean stop after the current page; press it again to exit.",
    after_help = "EXAMPLES:\n    \
        keyspace-bulk count 'session:*'\n    \
        keyspace-bulk delete 'session:*' --type hash\n    \
        keyspace-bulk -u redis://10.0.0.5:7000 unlink 'cache:*' --concurrency 4\n    \
        keyspace-bulk upload seed.jsonl --format json"
)]
pub struct CliArgs {
    /// Store URL (redis://[user:pass@]host:port[/db])
    #[arg(short = 'u', long, env = "REDIS_URL", default_value = DEFAULT_URL, global = true)]
    pub url: String,

    #[command(subcommand)]
    pub command: Command,

    /// SCAN COUNT hint per page
    #[arg(long, default_value = "10000", value_name = "NUM", global = true)]
    pub page_size: usize,

    /// Floor for the adaptive COUNT hint
    #[arg(long, default_value = "100", value_name = "NUM", global = true)]
    pub min_page_size: usize,

    /// Commands per pipelined round trip
    #[arg(long, default_value = "1000", value_name = "NUM", global = true)]
    pub pipeline_chunk: usize,

    /// Shards processed at once
    #[arg(short = 'c', long, default_value = "1", value_name = "NUM", global = true)]
    pub concurrency: usize,

    /// Maximum retained per-key errors
    #[arg(long, default_value = "500", value_name = "NUM", global = true)]
    pub error_cap: usize,

    /// Maximum retained sample keys
    #[arg(long, default_value = "1000", value_name = "NUM", global = true)]
    pub sample_cap: usize,

    /// Per-call timeout in seconds
    #[arg(long, default_value = "30", value_name = "SECS", global = true)]
    pub timeout: u64,

    /// Retries for a failed page
    #[arg(long, default_value = "1", value_name = "NUM", global = true)]
    pub retries: u32,

    /// Output format for the final summary
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Subcommands
#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Delete every matching key (DEL)
    Delete(FilterArgs),

    /// Unlink every matching key (UNLINK, freed in the background)
    Unlink(FilterArgs),

    /// Write records from a JSON-lines file
    Upload {
        /// File with one {"key", "value", "ttl_ms"} object per line
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Count matching keys per shard without changing anything
    Count(FilterArgs),
}

/// Key selection shared by the scanning subcommands
#[derive(clap::Args, Debug, Clone)]
pub struct FilterArgs {
    /// Glob pattern (*, ?, [abc])
    #[arg(value_name = "PATTERN", default_value = DEFAULT_PATTERN)]
    pub pattern: String,

    /// Only keys of this type (string, list, set, zset, hash, stream, json, timeseries)
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    pub key_type: Option<String>,

    /// COUNT hint for this run (overrides --page-size)
    #[arg(long, value_name = "NUM")]
    pub count: Option<usize>,
}

impl FilterArgs {
    /// Build a key filter, parsing the type name
    pub fn to_filter(&self) -> crate::error::Result<KeyFilter> {
        let key_type = match &self.key_type {
            Some(name) => Some(name.parse::<KeyType>()?),
            None => None,
        };
        Ok(KeyFilter {
            pattern: self.pattern.clone(),
            key_type,
            count: self.count,
        })
    }
}

/// Final summary output format
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

/// Engine configuration
///
/// Passed explicitly to [`BulkActionManager::new`](crate::runner::BulkActionManager::new);
/// every run created by that manager shares it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkConfig {
    /// SCAN COUNT hint per page
    pub page_size: usize,

    /// Floor for the adaptive COUNT hint
    pub min_page_size: usize,

    /// Maximum retained per-key errors
    pub error_cap: usize,

    /// Maximum retained sample keys
    pub sample_cap: usize,

    /// Deadline for each scan or pipeline call
    pub per_call_timeout: Duration,

    /// Retries for a failed page
    pub page_retries: u32,

    /// Commands per pipelined round trip
    pub pipeline_chunk: usize,

    /// Shards processed at once (1 = sequential)
    pub shard_concurrency: usize,

    /// Progress events buffered per run
    pub event_buffer: usize,

    /// How long terminal runs stay readable
    pub retention: Duration,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            page_size: 10_000,
            min_page_size: 100,
            error_cap: 500,
            sample_cap: 1_000,
            per_call_timeout: Duration::from_secs(30),
            page_retries: 1,
            pipeline_chunk: 1_000,
            shard_concurrency: 1,
            event_buffer: 256,
            retention: Duration::from_secs(300),
        }
    }
}

impl BulkConfig {
    /// Check ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("page size", self.page_size),
            ("min page size", self.min_page_size),
            ("pipeline chunk", self.pipeline_chunk),
            ("event buffer", self.event_buffer),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }

        if self.per_call_timeout.is_zero() {
            return Err(ConfigError::Zero {
                name: "per-call timeout",
            });
        }

        if self.min_page_size > self.page_size {
            return Err(ConfigError::MinAbovePageSize {
                min: self.min_page_size,
                page_size: self.page_size,
            });
        }

        if self.shard_concurrency == 0 || self.shard_concurrency > MAX_SHARD_CONCURRENCY {
            return Err(ConfigError::InvalidConcurrency {
                count: self.shard_concurrency,
                max: MAX_SHARD_CONCURRENCY,
            });
        }

        Ok(())
    }

    /// Create and validate configuration from CLI arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self, ConfigError> {
        validate_url(&args.url)?;

        let config = Self {
            page_size: args.page_size,
            min_page_size: args.min_page_size.min(args.page_size),
            error_cap: args.error_cap,
            sample_cap: args.sample_cap,
            per_call_timeout: Duration::from_secs(args.timeout),
            page_retries: args.retries,
            pipeline_chunk: args.pipeline_chunk,
            shard_concurrency: args.concurrency,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }
}

/// Reject URLs the redis client cannot use
pub fn validate_url(url: &str) -> Result<(), ConfigError> {
    let url = url.trim();
    let scheme_ok = ["redis://", "rediss://", "redis+unix://", "unix://"]
        .iter()
        .any(|s| url.starts_with(s));
    if !scheme_ok {
        return Err(ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: "Expected redis://host:port, rediss://host:port or unix:///path".into(),
        });
    }

    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or_default();
    if rest.is_empty() {
        return Err(ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: "Missing host".into(),
        });
    }
    Ok(())
}
