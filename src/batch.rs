//! Applies change batches to the destination.
//!
//! # Design
//!
//! ```text
//! ChangeBatch ──┬──▶ coalesce by (pk, id) ──▶ upsert per record ──▶ ApplyOutcome
//!               │    (latest snapshot wins)    │
//!               │                              ├─ Retryable: backoff, retry
//!               │                              ├─ Fatal: skip + report
//!               │                              └─ attempts exhausted: Err
//!               └──▶ malformed entries ──────────────────────────▶ skipped
//! ```
//!
//! With `apply_concurrency == 1` records are written strictly in batch order,
//! each acknowledged before the next is sent. Higher concurrency is only
//! allowed after coalescing, so no two in-flight writes target one record.

use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::config::ReplayConfig;
use crate::destination::{DestinationWriter, WriteError};
use crate::error::{MigrationError, Result};
use crate::feed::{ChangeBatch, ChangeRecord};
use crate::lease::{now_ms, SkippedRecord};
use crate::resilience::{RateLimiter, RetryConfig};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A record to write, with its position in the batch as read.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub position: usize,
    pub record: ChangeRecord,
}

/// Keep only the latest snapshot per `(partition key, id)`.
///
/// A surviving record keeps the position of its first occurrence, so writes
/// still go out in first-seen order. Returns the writes and how many
/// snapshots were dropped.
pub fn coalesce(records: &[ChangeRecord]) -> (Vec<PendingWrite>, usize) {
    let mut slots: HashMap<(&str, &str), usize> = HashMap::with_capacity(records.len());
    let mut writes: Vec<PendingWrite> = Vec::with_capacity(records.len());

    for (position, record) in records.iter().enumerate() {
        match slots.get(&(record.partition_key.as_str(), record.id.as_str())) {
            Some(&slot) => writes[slot].record = record.clone(),
            None => {
                slots.insert((record.partition_key.as_str(), record.id.as_str()), writes.len());
                writes.push(PendingWrite {
                    position,
                    record: record.clone(),
                });
            }
        }
    }

    let dropped = records.len() - writes.len();
    (writes, dropped)
}

/// Result of applying one batch.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Entries in the batch as read, malformed ones included.
    pub read: usize,
    /// Successful upserts.
    pub applied: usize,
    /// Snapshots dropped by coalescing.
    pub coalesced: usize,
    /// Rejected records in batch order, then malformed entries.
    pub skipped: Vec<SkippedRecord>,
}

enum RecordOutcome {
    Applied,
    Skipped(String),
}

/// Writes batches to the destination with retry, circuit breaking and rate limiting.
///
/// One applier is shared by every replay worker in the process.
pub struct BatchApplier {
    destination: Arc<dyn DestinationWriter>,
    circuit: Arc<CircuitBreaker>,
    limiter: Option<Arc<RateLimiter>>,
    retry: RetryConfig,
    concurrency: usize,
    coalesce_by_id: bool,
}

impl BatchApplier {
    pub fn new(
        destination: Arc<dyn DestinationWriter>,
        circuit: Arc<CircuitBreaker>,
        limiter: Option<Arc<RateLimiter>>,
        config: &ReplayConfig,
    ) -> Self {
        Self {
            destination,
            circuit,
            limiter,
            retry: RetryConfig::writes(config.max_write_attempts, config.write_backoff()),
            concurrency: config.apply_concurrency.max(1),
            coalesce_by_id: config.coalesce_by_id,
        }
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    /// Apply every record of `batch` to the destination.
    ///
    /// Returns once every record is acknowledged or skipped. An `Err` means a
    /// record exhausted its write attempts: the batch must not be
    /// checkpointed.
    pub async fn apply(&self, partition_id: &str, batch: &ChangeBatch) -> Result<ApplyOutcome> {
        let start = Instant::now();

        let (writes, coalesced) = if self.coalesce_by_id {
            coalesce(&batch.records)
        } else {
            let writes = batch
                .records
                .iter()
                .enumerate()
                .map(|(position, record)| PendingWrite {
                    position,
                    record: record.clone(),
                })
                .collect();
            (writes, 0)
        };

        let results: Vec<(usize, &PendingWrite, RecordOutcome)> = if self.concurrency == 1 {
            let mut results = Vec::with_capacity(writes.len());
            for write in &writes {
                let outcome = self.apply_one(partition_id, &write.record).await?;
                results.push((write.position, write, outcome));
            }
            results
        } else {
            let futures: Vec<_> = writes
                .iter()
                .map(|write| async move {
                    let outcome = self.apply_one(partition_id, &write.record).await?;
                    Ok::<_, MigrationError>((write.position, write, outcome))
                })
                .collect();
            stream::iter(futures)
                .buffer_unordered(self.concurrency)
                .try_collect()
                .await?
        };

        let skipped_at_ms = now_ms();
        let mut applied = 0;
        let mut rejected: Vec<(usize, SkippedRecord)> = Vec::new();

        for (position, write, outcome) in results {
            match outcome {
                RecordOutcome::Applied => applied += 1,
                RecordOutcome::Skipped(reason) => rejected.push((
                    position,
                    SkippedRecord {
                        partition_id: partition_id.to_string(),
                        record_id: write.record.id.clone(),
                        partition_key: Some(write.record.partition_key.clone()),
                        reason: format!("position {}: {}", position, reason),
                        skipped_at_ms,
                    },
                )),
            }
        }
        rejected.sort_by_key(|(position, _)| *position);
        let mut skipped: Vec<SkippedRecord> = rejected.into_iter().map(|(_, s)| s).collect();

        // Malformed positions count from the start of the read window.
        for entry in &batch.malformed {
            warn!(
                partition_id = %partition_id,
                entry_id = %entry.entry_id,
                position = entry.position,
                reason = %entry.reason,
                "Skipping malformed source entry"
            );
            skipped.push(SkippedRecord {
                partition_id: partition_id.to_string(),
                record_id: entry.entry_id.clone(),
                partition_key: None,
                reason: format!("window position {}: malformed entry: {}", entry.position, entry.reason),
                skipped_at_ms,
            });
        }

        crate::metrics::record_batch_applied(
            partition_id,
            batch.len(),
            applied,
            coalesced,
            skipped.len(),
            start.elapsed(),
        );
        debug!(
            partition_id = %partition_id,
            read = batch.len(),
            applied,
            coalesced,
            skipped = skipped.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Applied batch"
        );

        Ok(ApplyOutcome {
            read: batch.len(),
            applied,
            coalesced,
            skipped,
        })
    }

    async fn apply_one(&self, partition_id: &str, record: &ChangeRecord) -> Result<RecordOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }

            let result = self
                .circuit
                .call_counting(WriteError::is_retryable, || self.destination.upsert(record))
                .await;

            let failure = match result {
                Ok(()) => {
                    crate::metrics::record_upsert("applied");
                    return Ok(RecordOutcome::Applied);
                }
                Err(CircuitError::Inner(WriteError::Fatal(reason))) => {
                    crate::metrics::record_upsert("skipped");
                    warn!(
                        partition_id = %partition_id,
                        record_id = %record.id,
                        partition_key = %record.partition_key,
                        reason = %reason,
                        "Record rejected by destination, skipping"
                    );
                    return Ok(RecordOutcome::Skipped(reason));
                }
                Err(CircuitError::Inner(WriteError::Retryable(message))) => message,
                Err(CircuitError::Rejected) => "circuit breaker open".to_string(),
            };

            if attempt >= self.retry.max_attempts {
                crate::metrics::record_upsert("failed");
                return Err(MigrationError::Destination {
                    record_id: record.id.clone(),
                    message: format!("gave up after {} attempts: {}", attempt, failure),
                });
            }

            crate::metrics::record_upsert("retried");
            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                partition_id = %partition_id,
                record_id = %record.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Destination write failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl std::fmt::Debug for BatchApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchApplier")
            .field("circuit", &self.circuit)
            .field("limiter", &self.limiter)
            .field("max_attempts", &self.retry.max_attempts)
            .field("concurrency", &self.concurrency)
            .field("coalesce_by_id", &self.coalesce_by_id)
            .finish()
    }
}
