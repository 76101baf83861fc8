// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source change stream.
//!
//! A [`ChangeFeed`] exposes the source container as a set of partitions, each
//! an ordered log of record snapshots. Reads start after an opaque
//! [`ContinuationToken`] and return the token to resume from next time.
//!
//! ```text
//! partition p-0:  [A v1] [B v1] [A v2] [C v1] ...
//!                  ▲             ▲
//!                  │             └── token after batch 1
//!                  └── no token = full history
//! ```
//!
//! Records within a partition come back in commit order. There is no order
//! across partitions.
//!
//! [`ChangeStreamReader`] wraps a feed with retry and metrics; replay workers
//! only ever talk to the reader.

mod memory;
mod redis_feed;

pub use self::memory::MemoryChangeFeed;
pub use self::redis_feed::{
    calculate_lag_ms, compare_stream_ids, compute_content_hash, maybe_decompress, parse_entry, parse_stream_id_timestamp,
    RedisChangeFeed, SourceEntry,
};

use crate::error::{MigrationError, Result};
use crate::lease::{BoxFuture, ContinuationToken};
use crate::resilience::RetryConfig;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// One create/update observed on the source: the full current state of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub id: String,
    /// Partition key *value* the record lives under.
    pub partition_key: String,
    /// Full JSON document. A snapshot, not a diff.
    pub payload: Value,
}

impl ChangeRecord {
    pub fn new(id: impl Into<String>, partition_key: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            partition_key: partition_key.into(),
            payload,
        }
    }

    /// Build a record from a payload, reading `id` and the partition key from it.
    pub fn from_payload(payload: Value, partition_key_path: &str) -> Result<Self> {
        let id = payload
            .get("id")
            .and_then(scalar_to_string)
            .ok_or_else(|| MigrationError::StreamParse("payload has no 'id'".to_string()))?;
        let partition_key = extract_partition_key(&payload, partition_key_path).ok_or_else(|| {
            MigrationError::StreamParse(format!("payload has no partition key at '{}'", partition_key_path))
        })?;
        Ok(Self {
            id,
            partition_key,
            payload,
        })
    }
}

/// Read a partition key value from a document by JSON pointer path (`/tenantId`).
///
/// Strings are taken as-is; numbers and booleans use their JSON text.
pub fn extract_partition_key(payload: &Value, path: &str) -> Option<String> {
    payload.pointer(path).and_then(scalar_to_string)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A source entry that could not be turned into a [`ChangeRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedEntry {
    /// Source-side identifier of the entry (e.g. a stream entry id).
    pub entry_id: String,
    /// Position within the read window.
    pub position: usize,
    pub reason: String,
}

/// An ordered run of changes from one partition, plus where to resume.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub records: Vec<ChangeRecord>,
    pub malformed: Vec<MalformedEntry>,
    /// Token positioned after every entry in this batch.
    pub next_token: ContinuationToken,
}

impl ChangeBatch {
    pub fn len(&self) -> usize {
        self.records.len() + self.malformed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.malformed.is_empty()
    }
}

/// Result of a change stream read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult {
    Batch(ChangeBatch),
    /// Nothing after the token yet. Not an error: poll again later with the same token.
    NoNewChanges,
    /// The partition is sealed and everything up to the seal has been read.
    EndOfPartition,
}

/// A partitioned, ordered source change stream.
pub trait ChangeFeed: Send + Sync {
    /// Current set of partition ids.
    fn list_partitions(&self) -> BoxFuture<'_, Vec<String>>;

    /// Read up to `max_batch_size` entries after `continuation` (or from the
    /// earliest retained entry when `None`).
    fn read_batch<'a>(
        &'a self,
        partition_id: &'a str,
        continuation: Option<&'a ContinuationToken>,
        max_batch_size: usize,
    ) -> BoxFuture<'a, ReadResult>;

    /// How far behind the head `continuation` is, in milliseconds, if known.
    fn estimate_lag<'a>(
        &'a self,
        _partition_id: &'a str,
        _continuation: Option<&'a ContinuationToken>,
    ) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async { Ok(None) })
    }

    /// Check the source exists and is reachable.
    fn verify(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Retrying, instrumented front end over a [`ChangeFeed`].
#[derive(Clone)]
pub struct ChangeStreamReader {
    feed: Arc<dyn ChangeFeed>,
    retry: RetryConfig,
}

impl ChangeStreamReader {
    pub fn new(feed: Arc<dyn ChangeFeed>, retry: RetryConfig) -> Self {
        Self { feed, retry }
    }

    pub fn feed(&self) -> &Arc<dyn ChangeFeed> {
        &self.feed
    }

    /// List partitions, retrying transient failures.
    pub async fn list_partitions(&self) -> Result<Vec<String>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.feed.list_partitions().await {
                Ok(mut partitions) => {
                    partitions.sort();
                    partitions.dedup();
                    return Ok(partitions);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Partition listing failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read one batch, retrying transient failures with backoff.
    ///
    /// The error surfaces only once the attempts are exhausted.
    pub async fn read_batch(
        &self,
        partition_id: &str,
        continuation: Option<&ContinuationToken>,
        max_batch_size: usize,
    ) -> Result<ReadResult> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let start = Instant::now();
            match self.feed.read_batch(partition_id, continuation, max_batch_size).await {
                Ok(result) => {
                    match &result {
                        ReadResult::Batch(batch) => {
                            crate::metrics::record_source_read(
                                partition_id,
                                batch.records.len(),
                                batch.malformed.len(),
                                start.elapsed(),
                            );
                            debug!(
                                partition_id = %partition_id,
                                records = batch.records.len(),
                                malformed = batch.malformed.len(),
                                next_token = %batch.next_token,
                                "Read change batch"
                            );
                        }
                        _ => crate::metrics::record_source_read(partition_id, 0, 0, start.elapsed()),
                    }
                    return Ok(result);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        partition_id = %partition_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Change stream read failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    crate::metrics::record_source_read_error(partition_id);
                    if e.is_retryable() {
                        return Err(MigrationError::source_read(
                            partition_id,
                            format!("gave up after {} attempts: {}", attempt, e),
                        ));
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Lag estimate for metrics. Failures are logged and reported as unknown.
    pub async fn estimate_lag(&self, partition_id: &str, continuation: Option<&ContinuationToken>) -> Option<u64> {
        match self.feed.estimate_lag(partition_id, continuation).await {
            Ok(lag) => lag,
            Err(e) => {
                debug!(partition_id = %partition_id, error = %e, "Lag estimate failed");
                None
            }
        }
    }
}
