// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Migrator errors.
//!
//! | Variant | Retryable | Raised by |
//! |---------|-----------|-----------|
//! | `Redis` | Yes | Source stream or destination commands |
//! | `LeaseStore` | Yes | SQLite busy, locked or pool timeouts |
//! | `SourceRead` | Yes | Change stream reader, after its own retries |
//! | `Destination` | Yes | Batch applier, once write attempts run out |
//! | `Config` | No | Loading, validation, container settings mismatch |
//! | `Decompression` | No | Corrupt zstd payload |
//! | `StreamParse` | No | Change entry missing fields or not JSON |
//! | `InvalidState` | No | Engine lifecycle misuse |
//! | `Internal` | No | Anything else |
//!
//! Losing a lease race is not an error. The store answers
//! [`LeaseOutcome::Conflict`](crate::lease::LeaseOutcome::Conflict) instead.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrationError>;

#[derive(Error, Debug)]
pub enum MigrationError {
    /// A Redis command failed. `operation` names the command or step.
    #[error("redis {operation} failed: {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    #[error("lease store: {0}")]
    LeaseStore(#[from] sqlx::Error),

    /// Fix the configuration and restart; nothing retries this.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("reading partition {partition_id}: {message}")]
    SourceRead { partition_id: String, message: String },

    #[error("zstd payload: {0}")]
    Decompression(String),

    #[error("malformed change entry: {0}")]
    StreamParse(String),

    /// A write for `record_id` kept failing transiently.
    #[error("writing record {record_id}: {message}")]
    Destination { record_id: String, message: String },

    /// e.g. `start()` on an engine that is already running.
    #[error("engine is {actual}, expected {expected}")]
    InvalidState { expected: String, actual: String },

    #[error("internal: {0}")]
    Internal(String),
}

impl MigrationError {
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Redis-side failure with no underlying `RedisError`, such as an unexpected reply shape.
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn source_read(partition_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceRead {
            partition_id: partition_id.into(),
            message: message.into(),
        }
    }

    /// Whether backing off and trying again can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Redis { .. } | Self::LeaseStore(_) | Self::SourceRead { .. } | Self::Destination { .. }
        )
    }
}

impl From<redis::RedisError> for MigrationError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("command", e)
    }
}
