// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay worker: the per-partition read → apply → checkpoint loop.
//!
//! ```text
//!   ┌──────────────▶ read_batch(token) ────── NoNewChanges ──▶ sleep(poll)
//!   │                     │                                        │
//!   │                   Batch                  EndOfPartition      │
//!   │                     ▼                          │             │
//!   │               apply (all records)              ▼             │
//!   │                     │                     exit Ended         │
//!   │                     ▼                                        │
//!   └──── checkpoint(next_token) ◀─────────────────────────────────┘
//! ```
//!
//! The token only moves after every record of the batch is acknowledged by
//! the destination, so a crash anywhere in the loop replays at most one
//! batch. Replays are harmless because upserts are idempotent.
//!
//! # Stopping
//!
//! The stop signal is honored while waiting on a read or on the poll sleep,
//! never while a batch is being applied. A worker told to stop always
//! finishes its batch and checkpoints first.

use super::types::WorkerExit;
use crate::batch::BatchApplier;
use crate::config::ReplayConfig;
use crate::error::Result;
use crate::feed::{ChangeStreamReader, ReadResult};
use crate::lease::{ContinuationToken, Lease, LeaseOutcome, LeaseRequest, LeaseStore, SkippedRecord};
use crate::metrics;
use crate::resilience::RetryConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Everything one replay worker needs.
pub(crate) struct WorkerContext {
    pub partition_id: String,
    pub owner_id: String,
    /// Shared with the coordinator, which renews through it.
    pub lease: Arc<Mutex<Lease>>,
    pub reader: ChangeStreamReader,
    pub applier: Arc<BatchApplier>,
    pub lease_store: Arc<dyn LeaseStore>,
    pub replay: ReplayConfig,
    pub lease_duration: Duration,
    pub stop_rx: watch::Receiver<bool>,
}

/// Run the replay loop for one owned partition until it exits.
pub(crate) async fn run_worker(ctx: WorkerContext) -> WorkerExit {
    let span = info_span!("replay", partition_id = %ctx.partition_id);
    replay_loop(ctx).instrument(span).await
}

/// Rate limit for lag estimates.
struct LagSampler {
    every: Duration,
    last: Option<Instant>,
}

impl LagSampler {
    fn new(every: Duration) -> Self {
        Self { every, last: None }
    }

    /// True at most once per interval; the first call always samples.
    fn due(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.every => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Resolves once a stop is requested or the coordinator is gone.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn replay_loop(mut ctx: WorkerContext) -> WorkerExit {
    let poll_interval = ctx.replay.poll_interval();
    let write_retry = RetryConfig::writes(ctx.replay.checkpoint_attempts, ctx.replay.write_backoff());
    let mut lag_sampler = LagSampler::new(ctx.replay.lag_sample_interval());

    {
        let lease = ctx.lease.lock().await;
        info!(
            continuation = lease.continuation.as_ref().map(|t| t.as_str()).unwrap_or("<start>"),
            version = lease.version,
            "Replay worker started"
        );
    }

    loop {
        if *ctx.stop_rx.borrow() {
            info!("Replay worker stopped");
            return WorkerExit::Stopped;
        }

        let token = ctx.lease.lock().await.continuation.clone();

        let read = tokio::select! {
            biased;
            _ = stop_requested(&mut ctx.stop_rx) => {
                info!("Replay worker stopped while reading");
                return WorkerExit::Stopped;
            }
            result = ctx.reader.read_batch(&ctx.partition_id, token.as_ref(), ctx.replay.max_batch_size) => result,
        };

        let batch = match read {
            Ok(ReadResult::Batch(batch)) => batch,
            Ok(ReadResult::NoNewChanges) => {
                tokio::select! {
                    biased;
                    _ = stop_requested(&mut ctx.stop_rx) => {
                        info!("Replay worker stopped while idle");
                        return WorkerExit::Stopped;
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                continue;
            }
            Ok(ReadResult::EndOfPartition) => {
                info!("End of partition reached");
                return WorkerExit::Ended;
            }
            Err(e) => {
                error!(error = %e, "Change stream read failed");
                return WorkerExit::Failed(e.to_string());
            }
        };

        // Not cancellable: the batch is finished even if a stop arrives now.
        let outcome = match ctx.applier.apply(&ctx.partition_id, &batch).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Batch apply failed, not checkpointing");
                return WorkerExit::Failed(e.to_string());
            }
        };

        if let Err(e) = record_skips(&ctx, &write_retry, outcome.skipped).await {
            error!(error = %e, "Could not record skipped records, not checkpointing");
            return WorkerExit::Failed(e.to_string());
        }

        match checkpoint(&ctx, &write_retry, &batch.next_token).await {
            Ok(true) => {
                debug!(
                    token = %batch.next_token,
                    applied = outcome.applied,
                    "Checkpointed"
                );
                if lag_sampler.due(Instant::now()) {
                    if let Some(lag) = ctx.reader.estimate_lag(&ctx.partition_id, Some(&batch.next_token)).await {
                        metrics::record_partition_lag_ms(&ctx.partition_id, lag);
                    }
                }
            }
            Ok(false) => {
                warn!("Checkpoint conflict, lease lost");
                return WorkerExit::LeaseLost;
            }
            Err(e) => {
                error!(error = %e, "Checkpoint failed");
                return WorkerExit::Failed(e.to_string());
            }
        }
    }
}

/// Persist `token` on the lease. `Ok(false)` means ownership was lost.
async fn checkpoint(ctx: &WorkerContext, retry: &RetryConfig, token: &ContinuationToken) -> Result<bool> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut lease = ctx.lease.lock().await;
        let request =
            LeaseRequest::claim(&lease, ctx.owner_id.as_str(), ctx.lease_duration).with_continuation(token.clone());

        match ctx.lease_store.acquire_or_renew(request).await {
            Ok(LeaseOutcome::Granted(updated)) => {
                *lease = updated;
                metrics::record_checkpoint(&ctx.partition_id, true);
                return Ok(true);
            }
            Ok(LeaseOutcome::Conflict) => {
                metrics::record_checkpoint(&ctx.partition_id, false);
                metrics::record_lease_conflict(&ctx.partition_id, "checkpoint");
                return Ok(false);
            }
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                drop(lease);
                let delay = retry.delay_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Checkpoint failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                metrics::record_checkpoint(&ctx.partition_id, false);
                return Err(e);
            }
        }
    }
}

async fn record_skips(ctx: &WorkerContext, retry: &RetryConfig, skipped: Vec<SkippedRecord>) -> Result<()> {
    for record in skipped {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match ctx.lease_store.record_skip(record.clone()).await {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}
