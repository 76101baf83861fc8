// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Partition coordinator: discovery, acquisition, renewal and release.
//!
//! One coordinator task per process. It owns the set of running replay
//! workers and is the only place leases are acquired, renewed or released.
//! Workers only touch their own lease to checkpoint.
//!
//! # Timers
//!
//! ```text
//! discovery_interval ──▶ reap finished workers, list partitions, read leases,
//!                        acquire what is free, expired or already ours
//! renew_interval     ──▶ reap finished workers, renew every owned lease
//! ```
//!
//! # Lease Handles
//!
//! Each owned partition's [`Lease`] sits behind an async mutex shared by the
//! worker (checkpoints) and the coordinator (renewals). Whoever holds the
//! mutex sees the latest version, so the two never race each other's CAS.

use super::types::{PartitionState, PartitionStatus, PartitionTable, WorkerExit};
use super::worker::{run_worker, WorkerContext};
use crate::batch::BatchApplier;
use crate::config::{LeaseConfig, ReplayConfig};
use crate::error::Result;
use crate::feed::ChangeStreamReader;
use crate::lease::{now_ms, Lease, LeaseOutcome, LeaseRequest, LeaseStore, ReleaseOutcome};
use crate::metrics;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

struct Slot {
    lease: Arc<Mutex<Lease>>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<WorkerExit>,
    state: PartitionState,
}

#[derive(Debug, Default)]
struct History {
    state: Option<PartitionState>,
    consecutive_failures: u32,
    retry_at: Option<Instant>,
}

/// Owns the replay workers of this instance.
pub(crate) struct PartitionCoordinator {
    owner_id: String,
    lease_config: LeaseConfig,
    replay: ReplayConfig,
    reader: ChangeStreamReader,
    applier: Arc<BatchApplier>,
    lease_store: Arc<dyn LeaseStore>,
    slots: HashMap<String, Slot>,
    history: HashMap<String, History>,
    known: BTreeSet<String>,
    table_tx: watch::Sender<PartitionTable>,
}

impl PartitionCoordinator {
    pub(crate) fn new(
        owner_id: String,
        lease_config: LeaseConfig,
        replay: ReplayConfig,
        reader: ChangeStreamReader,
        applier: Arc<BatchApplier>,
        lease_store: Arc<dyn LeaseStore>,
        table_tx: watch::Sender<PartitionTable>,
    ) -> Self {
        Self {
            owner_id,
            lease_config,
            replay,
            reader,
            applier,
            lease_store,
            slots: HashMap::new(),
            history: HashMap::new(),
            known: BTreeSet::new(),
            table_tx,
        }
    }

    /// Run discovery and renewal until `shutdown_rx` flips, then drain.
    pub(crate) async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut discovery = tokio::time::interval(self.lease_config.discovery_interval());
        discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut renewal = tokio::time::interval(self.lease_config.renew_interval());
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first tick of an interval fires immediately; start() already
        // ran a discovery pass.
        discovery.tick().await;
        renewal.tick().await;

        info!(
            owner_id = %self.owner_id,
            discovery_interval_ms = self.lease_config.discovery_interval().as_millis() as u64,
            renew_interval_ms = self.lease_config.renew_interval().as_millis() as u64,
            "Partition coordinator running"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = renewal.tick() => {
                    self.reap().await;
                    self.renew_all().await;
                    self.publish();
                }
                _ = discovery.tick() => {
                    self.reap().await;
                    if let Err(e) = self.discover().await {
                        warn!(error = %e, "Partition discovery failed, retrying next cycle");
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// One discovery pass: list partitions and leases, acquire what is available.
    pub(crate) async fn discover(&mut self) -> Result<()> {
        let partitions = self.reader.list_partitions().await?;
        let leases = self.lease_store.read_all().await?;
        let now = now_ms();

        self.known = partitions.iter().cloned().collect();
        let mut by_partition: HashMap<String, Lease> = HashMap::with_capacity(leases.len());
        for lease in leases {
            if !self.known.contains(&lease.partition_id) && !self.slots.contains_key(&lease.partition_id) {
                debug!(partition_id = %lease.partition_id, "Ignoring lease for unknown partition");
                continue;
            }
            by_partition.insert(lease.partition_id.clone(), lease);
        }

        let budget = match self.lease_config.max_partitions {
            Some(max) => max.saturating_sub(self.slots.len()),
            None => usize::MAX,
        };

        let now_instant = Instant::now();
        let candidates: Vec<String> = partitions
            .into_iter()
            .filter(|pid| !self.slots.contains_key(pid))
            .filter(|pid| {
                self.history.get(pid).map_or(true, |h| {
                    h.state != Some(PartitionState::Ended) && h.retry_at.map_or(true, |at| at <= now_instant)
                })
            })
            .filter(|pid| {
                by_partition
                    .get(pid)
                    .map_or(true, |lease| lease.is_available_to(&self.owner_id, now))
            })
            .take(budget)
            .collect();

        for partition_id in candidates {
            let existing = by_partition.get(&partition_id);
            let request = match existing {
                None => LeaseRequest::create(partition_id.as_str(), self.owner_id.as_str(), self.lease_config.lease_duration()),
                Some(lease) => LeaseRequest::claim(lease, self.owner_id.as_str(), self.lease_config.lease_duration()),
            };
            let takeover = existing.is_some_and(|l| l.owner.as_deref().is_some_and(|o| o != self.owner_id));

            match self.lease_store.acquire_or_renew(request).await {
                Ok(LeaseOutcome::Granted(lease)) => {
                    info!(
                        partition_id = %partition_id,
                        version = lease.version,
                        takeover,
                        continuation = lease.continuation.as_ref().map(|t| t.as_str()).unwrap_or("<start>"),
                        "Acquired partition lease"
                    );
                    metrics::record_lease_acquired(&partition_id, takeover);
                    self.spawn_worker(lease);
                }
                Ok(LeaseOutcome::Conflict) => {
                    debug!(partition_id = %partition_id, "Lease acquisition lost to another instance");
                    metrics::record_lease_conflict(&partition_id, "acquire");
                }
                Err(e) => {
                    warn!(partition_id = %partition_id, error = %e, "Lease acquisition failed");
                }
            }
        }

        self.publish();
        Ok(())
    }

    fn spawn_worker(&mut self, lease: Lease) {
        let partition_id = lease.partition_id.clone();
        let lease = Arc::new(Mutex::new(lease));
        let (stop_tx, stop_rx) = watch::channel(false);

        let ctx = WorkerContext {
            partition_id: partition_id.clone(),
            owner_id: self.owner_id.clone(),
            lease: Arc::clone(&lease),
            reader: self.reader.clone(),
            applier: Arc::clone(&self.applier),
            lease_store: Arc::clone(&self.lease_store),
            replay: self.replay.clone(),
            lease_duration: self.lease_config.lease_duration(),
            stop_rx,
        };
        let handle = tokio::spawn(run_worker(ctx));

        self.history.entry(partition_id.clone()).or_default().state = None;
        self.slots.insert(
            partition_id,
            Slot {
                lease,
                stop_tx,
                handle,
                state: PartitionState::Owned,
            },
        );
        metrics::set_owned_partitions(self.slots.len());
    }

    /// Renew every owned lease. Lost or expired leases stop their worker at once.
    async fn renew_all(&mut self) {
        let duration = self.lease_config.lease_duration();
        let mut lost = Vec::new();

        for (partition_id, slot) in self.slots.iter_mut() {
            let mut lease = slot.lease.lock().await;
            let request = LeaseRequest::claim(&lease, self.owner_id.as_str(), duration);

            match self.lease_store.acquire_or_renew(request).await {
                Ok(LeaseOutcome::Granted(renewed)) => {
                    *lease = renewed;
                    slot.state = PartitionState::Owned;
                }
                Ok(LeaseOutcome::Conflict) => {
                    warn!(partition_id = %partition_id, "Lease renewal conflict, ownership lost");
                    metrics::record_lease_conflict(partition_id, "renew");
                    lost.push(partition_id.clone());
                }
                Err(e) if lease.expires_at_ms <= now_ms() => {
                    error!(partition_id = %partition_id, error = %e, "Lease expired while the store was unreachable");
                    lost.push(partition_id.clone());
                }
                Err(e) => {
                    warn!(partition_id = %partition_id, error = %e, "Lease renewal failed, will retry");
                    slot.state = PartitionState::Renewing;
                }
            }
        }

        for partition_id in lost {
            if let Some(slot) = self.slots.remove(&partition_id) {
                // No checkpoint: the new owner resumes from the last one.
                slot.handle.abort();
                metrics::record_lease_lost(&partition_id);
                self.history.entry(partition_id).or_default().state = Some(PartitionState::Expired);
            }
        }
        metrics::set_owned_partitions(self.slots.len());
    }

    /// Collect workers that have exited and act on why.
    async fn reap(&mut self) {
        let finished: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.handle.is_finished())
            .map(|(pid, _)| pid.clone())
            .collect();

        for partition_id in finished {
            let Some(slot) = self.slots.remove(&partition_id) else {
                continue;
            };
            let exit = match slot.handle.await {
                Ok(exit) => exit,
                Err(e) => WorkerExit::Failed(format!("worker task panicked: {}", e)),
            };
            self.settle(&partition_id, &slot.lease, exit).await;
        }
        metrics::set_owned_partitions(self.slots.len());
    }

    async fn settle(&mut self, partition_id: &str, lease: &Arc<Mutex<Lease>>, exit: WorkerExit) {
        match exit {
            WorkerExit::Stopped => {
                self.release(partition_id, lease).await;
                let history = self.history.entry(partition_id.to_string()).or_default();
                history.state = Some(PartitionState::Released);
                history.consecutive_failures = 0;
            }
            WorkerExit::Ended => {
                info!(partition_id = %partition_id, "Partition fully replayed");
                metrics::record_partition_ended(partition_id);
                self.release(partition_id, lease).await;
                let history = self.history.entry(partition_id.to_string()).or_default();
                history.state = Some(PartitionState::Ended);
                history.consecutive_failures = 0;
            }
            WorkerExit::LeaseLost => {
                metrics::record_lease_lost(partition_id);
                self.history.entry(partition_id.to_string()).or_default().state = Some(PartitionState::Expired);
            }
            WorkerExit::Failed(reason) => {
                metrics::record_partition_failure(partition_id);
                self.release(partition_id, lease).await;

                let history = self.history.entry(partition_id.to_string()).or_default();
                let backoff = self.replay.backoff_for_failures(history.consecutive_failures);
                history.consecutive_failures = history.consecutive_failures.saturating_add(1);
                history.state = Some(PartitionState::Failed);
                history.retry_at = Some(Instant::now() + backoff);

                error!(
                    partition_id = %partition_id,
                    reason = %reason,
                    consecutive_failures = history.consecutive_failures,
                    backoff_secs = backoff.as_secs(),
                    "Partition failed, lease released"
                );
            }
        }
    }

    async fn release(&self, partition_id: &str, lease: &Arc<Mutex<Lease>>) {
        let mut lease = lease.lock().await;
        match self
            .lease_store
            .release(partition_id, &self.owner_id, lease.version)
            .await
        {
            Ok(ReleaseOutcome::Released) => {
                lease.owner = None;
                lease.version += 1;
                metrics::record_lease_released(partition_id);
                debug!(partition_id = %partition_id, "Lease released");
            }
            Ok(ReleaseOutcome::Conflict) => {
                debug!(partition_id = %partition_id, "Lease already changed, nothing to release");
            }
            Err(e) => {
                warn!(partition_id = %partition_id, error = %e, "Lease release failed, it will expire");
            }
        }
    }

    /// Stop every worker, wait up to the grace period, release what stopped cleanly.
    pub(crate) async fn shutdown(&mut self) {
        let grace = self.replay.shutdown_grace();
        info!(workers = self.slots.len(), grace_ms = grace.as_millis() as u64, "Draining replay workers");

        for slot in self.slots.values() {
            let _ = slot.stop_tx.send(true);
        }

        let deadline = Instant::now() + grace;
        let slots: Vec<(String, Slot)> = self.slots.drain().collect();
        for (partition_id, mut slot) in slots {
            match tokio::time::timeout_at(deadline, &mut slot.handle).await {
                Ok(Ok(exit)) => {
                    self.settle(&partition_id, &slot.lease, exit).await;
                }
                Ok(Err(e)) => {
                    warn!(partition_id = %partition_id, error = %e, "Worker panicked during shutdown, lease left to expire");
                }
                Err(_) => {
                    slot.handle.abort();
                    warn!(partition_id = %partition_id, "Worker did not stop within grace period, lease left to expire");
                }
            }
        }

        metrics::set_owned_partitions(0);
        self.publish();
        info!("Replay workers drained");
    }

    fn publish(&self) {
        let mut table = PartitionTable::new();

        for partition_id in &self.known {
            table.insert(partition_id.clone(), PartitionStatus::new(PartitionState::Unowned));
        }
        for (partition_id, history) in &self.history {
            let status = table
                .entry(partition_id.clone())
                .or_insert_with(|| PartitionStatus::new(PartitionState::Unowned));
            if let Some(state) = history.state {
                status.state = state;
            }
            status.consecutive_failures = history.consecutive_failures;
        }
        for (partition_id, slot) in &self.slots {
            let status = table
                .entry(partition_id.clone())
                .or_insert_with(|| PartitionStatus::new(slot.state));
            status.state = slot.state;
            if let Ok(lease) = slot.lease.try_lock() {
                status.continuation = lease.continuation.clone();
            }
        }

        self.table_tx.send_replace(table);
    }
}
