//! Destination container writes.
//!
//! Every write is an idempotent upsert keyed by `(partition key value, id)`:
//! applying the same snapshot twice leaves the same state as applying it
//! once, which is what makes at-least-once replay safe.
//!
//! Failures are split in two:
//!
//! - [`WriteError::Retryable`]: throttling, timeouts, connection loss. The
//!   caller backs off and tries again.
//! - [`WriteError::Fatal`]: this record can never be written (too large,
//!   illegal id). The caller skips and reports it.

mod memory;
mod redis_destination;

pub use self::memory::MemoryDestination;
pub use self::redis_destination::RedisDestination;

use crate::config::MigrationTarget;
use crate::feed::ChangeRecord;
use crate::lease::BoxFuture;
use std::future::Future;
use std::pin::Pin;

/// Longest accepted record id, in bytes.
pub const MAX_ID_BYTES: usize = 255;

/// Characters that may not appear in a record id.
const ILLEGAL_ID_CHARS: [char; 4] = ['/', '\\', '?', '#'];

/// Why an upsert failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// Transient; the same write may succeed later.
    #[error("retryable write failure: {0}")]
    Retryable(String),

    /// Permanent for this record; never retry.
    #[error("fatal write failure: {0}")]
    Fatal(String),
}

impl WriteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Boxed future for a single upsert.
pub type WriteFuture<'a> = Pin<Box<dyn Future<Output = std::result::Result<(), WriteError>> + Send + 'a>>;

/// Idempotent writer for the destination container.
pub trait DestinationWriter: Send + Sync {
    /// Create the destination container if missing. Idempotent.
    ///
    /// Fails if the container exists with a different partition key path.
    fn ensure_container<'a>(&'a self, target: &'a MigrationTarget) -> BoxFuture<'a, ()>;

    /// Create or replace the record under `(record.partition_key, record.id)`.
    fn upsert<'a>(&'a self, record: &'a ChangeRecord) -> WriteFuture<'a>;
}

/// Checks every writer applies before touching the destination.
///
/// Returns the serialized payload on success.
pub fn prepare_record(record: &ChangeRecord, max_item_bytes: usize) -> std::result::Result<Vec<u8>, WriteError> {
    if record.id.is_empty() {
        return Err(WriteError::Fatal("record id is empty".to_string()));
    }
    if record.id.len() > MAX_ID_BYTES {
        return Err(WriteError::Fatal(format!(
            "record id is {} bytes, limit is {}",
            record.id.len(),
            MAX_ID_BYTES
        )));
    }
    if let Some(c) = record.id.chars().find(|c| ILLEGAL_ID_CHARS.contains(c) || c.is_control()) {
        return Err(WriteError::Fatal(format!("record id contains illegal character {:?}", c)));
    }

    let bytes = serde_json::to_vec(&record.payload)
        .map_err(|e| WriteError::Fatal(format!("payload cannot be serialized: {}", e)))?;
    if bytes.len() > max_item_bytes {
        return Err(WriteError::Fatal(format!(
            "payload is {} bytes, limit is {}",
            bytes.len(),
            max_item_bytes
        )));
    }
    Ok(bytes)
}
