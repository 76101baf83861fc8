// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Migration engine.
//!
//! Ties together:
//! - the source change stream via [`crate::feed::ChangeStreamReader`]
//! - the lease store via [`crate::lease::LeaseStore`]
//! - destination writes via [`crate::batch::BatchApplier`]
//! - a partition coordinator that runs one replay worker per owned partition
//!
//! # Lifecycle
//!
//! 1. [`MigrationEngine::start`] initializes the lease store, ensures the
//!    destination container, verifies the source, runs one discovery pass and
//!    spawns the coordinator task.
//! 2. The coordinator keeps discovering, acquiring and renewing leases.
//! 3. [`MigrationEngine::shutdown`] drains the workers: each finishes its
//!    in-flight batch, checkpoints and stops; leases are then released.
//!
//! Shutdown propagates engine → coordinator → workers over `watch` channels.

mod partition;
mod types;
mod worker;

pub use types::{EngineState, HealthCheck, PartitionState, PartitionStatus, PartitionTable, WorkerExit};

use crate::batch::BatchApplier;
use crate::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::config::MigrationConfig;
use crate::destination::DestinationWriter;
use crate::error::{MigrationError, Result};
use crate::feed::{ChangeFeed, ChangeStreamReader};
use crate::lease::{LeaseStore, SkippedRecord};
use crate::metrics;
use crate::resilience::{RateLimiter, RetryConfig};
use partition::PartitionCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The migration engine for one instance.
///
/// Several instances with the same `processor_name` and lease store share
/// the partitions between them.
pub struct MigrationEngine {
    config: MigrationConfig,

    feed: Arc<dyn ChangeFeed>,
    lease_store: Arc<dyn LeaseStore>,
    destination: Arc<dyn DestinationWriter>,

    /// Breaker shared by every worker's destination writes.
    circuit: Arc<CircuitBreaker>,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,

    /// Taken by the coordinator on start.
    table_tx: Option<watch::Sender<PartitionTable>>,
    table_rx: watch::Receiver<PartitionTable>,

    coordinator: Option<JoinHandle<()>>,
}

impl MigrationEngine {
    /// Create an engine over the given adapters. Nothing is contacted until
    /// [`start()`](Self::start).
    pub fn new(
        config: MigrationConfig,
        feed: Arc<dyn ChangeFeed>,
        lease_store: Arc<dyn LeaseStore>,
        destination: Arc<dyn DestinationWriter>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        let (table_tx, table_rx) = watch::channel(PartitionTable::new());

        Self {
            config,
            feed,
            lease_store,
            destination,
            circuit: Arc::new(CircuitBreaker::new("destination_writes", CircuitConfig::default())),
            state_tx,
            state_rx,
            shutdown_tx,
            table_tx: Some(table_tx),
            table_rx,
            coordinator: None,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Receiver for engine state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Receiver for the partition table, republished on every coordinator cycle.
    pub fn partitions_receiver(&self) -> watch::Receiver<PartitionTable> {
        self.table_rx.clone()
    }

    /// Latest partition table.
    pub fn partitions(&self) -> PartitionTable {
        self.table_rx.borrow().clone()
    }

    /// Partitions this instance currently owns, sorted.
    pub fn owned_partitions(&self) -> Vec<String> {
        self.table_rx
            .borrow()
            .iter()
            .filter(|(_, status)| status.state.is_owned())
            .map(|(pid, _)| pid.clone())
            .collect()
    }

    /// Records skipped so far by any instance sharing the lease store.
    pub async fn skipped(&self) -> Result<Vec<SkippedRecord>> {
        self.lease_store.skipped().await
    }

    /// Health for monitoring endpoints. No I/O.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let partitions = self.partitions();
        let owned_partitions = partitions.values().filter(|s| s.state.is_owned()).count();
        let failed_partitions = partitions
            .values()
            .filter(|s| s.state == PartitionState::Failed)
            .count();
        let destination_circuit_open = self.circuit.is_likely_open();

        let ready = state == EngineState::Running;
        let healthy = ready && !destination_circuit_open && failed_partitions == 0;

        HealthCheck {
            state,
            ready,
            healthy,
            owned_partitions,
            failed_partitions,
            destination_circuit_open,
            partitions,
        }
    }

    /// Start the engine.
    ///
    /// Returns once the first discovery pass is done and the coordinator is
    /// running. Any failure before that is fatal: the engine moves to
    /// `Failed` and the error is returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(MigrationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            instance = %self.config.instance_name,
            processor = %self.config.processor_name,
            source = %self.config.target.source_container,
            destination = %self.config.target.destination_container,
            "Starting migration engine"
        );
        self.set_state(EngineState::Starting);

        let mut coordinator = match self.prepare().await {
            Ok(coordinator) => coordinator,
            Err(e) => {
                error!(error = %e, "Migration engine failed to start");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };

        if let Err(e) = coordinator.discover().await {
            error!(error = %e, "Initial partition discovery failed");
            coordinator.shutdown().await;
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        let shutdown_rx = self.shutdown_tx.subscribe();
        self.coordinator = Some(tokio::spawn(coordinator.run(shutdown_rx)));

        self.set_state(EngineState::Running);
        info!(owned = self.owned_partitions().len(), "Migration engine running");
        Ok(())
    }

    async fn prepare(&mut self) -> Result<PartitionCoordinator> {
        self.config.validate()?;

        self.lease_store.initialize().await?;
        info!(container = %self.config.lease.container_name, "Lease store ready");

        self.destination.ensure_container(&self.config.target).await?;
        self.feed.verify().await?;

        let reader = ChangeStreamReader::new(
            Arc::clone(&self.feed),
            RetryConfig::reads(self.config.source.read_attempts),
        );

        let limiter = self.config.target.destination_throughput.map(|throughput| {
            info!(writes_per_sec = throughput, "Destination rate limit enabled");
            Arc::new(RateLimiter::per_second(throughput))
        });
        let applier = BatchApplier::new(
            Arc::clone(&self.destination),
            Arc::clone(&self.circuit),
            limiter,
            &self.config.replay,
        );

        let table_tx = self
            .table_tx
            .take()
            .ok_or_else(|| MigrationError::Internal("partition table already taken".to_string()))?;

        Ok(PartitionCoordinator::new(
            self.config.instance_name.clone(),
            self.config.lease.clone(),
            self.config.replay.clone(),
            reader,
            Arc::new(applier),
            Arc::clone(&self.lease_store),
            table_tx,
        ))
    }

    /// Shut down gracefully.
    ///
    /// Workers finish their in-flight batch and checkpoint. Leases of workers
    /// that stopped within the grace period are released; the rest expire.
    pub async fn shutdown(&mut self) {
        match self.state() {
            EngineState::Running => {}
            EngineState::Created | EngineState::Failed => {
                self.set_state(EngineState::Stopped);
                return;
            }
            EngineState::Starting | EngineState::ShuttingDown | EngineState::Stopped => return,
        }

        info!("Shutting down migration engine");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.coordinator.take() {
            // The coordinator bounds its own drain by the grace period.
            let limit = self.config.replay.shutdown_grace() + Duration::from_secs(5);
            match tokio::time::timeout(limit, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Coordinator task panicked during shutdown"),
                Err(_) => warn!("Coordinator did not finish draining in time"),
            }
        }

        self.set_state(EngineState::Stopped);
        info!("Migration engine stopped");
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::MemoryDestination;
    use crate::feed::MemoryChangeFeed;
    use crate::lease::MemoryLeaseStore;

    fn engine(config: MigrationConfig) -> (MigrationEngine, MemoryChangeFeed, MemoryDestination) {
        let feed = MemoryChangeFeed::new();
        let dest = MemoryDestination::default();
        let engine = MigrationEngine::new(
            config,
            Arc::new(feed.clone()),
            Arc::new(MemoryLeaseStore::new()),
            Arc::new(dest.clone()),
        );
        (engine, feed, dest)
    }

    #[test]
    fn test_engine_initial_state() {
        let (engine, _, _) = engine(MigrationConfig::for_testing("a"));
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());
        assert!(engine.owned_partitions().is_empty());
    }

    #[tokio::test]
    async fn test_engine_start_invalid_state() {
        let (mut engine, feed, _) = engine(MigrationConfig::for_testing("a"));
        feed.add_partition("p-0").await;

        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.owned_partitions(), vec!["p-0"]);

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, MigrationError::InvalidState { .. }));
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_engine_start_fails_on_bad_config() {
        let mut config = MigrationConfig::for_testing("a");
        config.instance_name = String::new();
        let (mut engine, _, _) = engine(config);

        assert!(engine.start().await.is_err());
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test]
    async fn test_engine_start_fails_on_key_path_mismatch() {
        let (mut engine, _, dest) = engine(MigrationConfig::for_testing("a"));
        let mut other = MigrationConfig::for_testing("a").target;
        other.destination_partition_key_path = Some("/elsewhere".to_string());
        dest.ensure_container(&other).await.unwrap();

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, MigrationError::Config(_)));
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test]
    async fn test_engine_shutdown_from_created() {
        let (mut engine, _, _) = engine(MigrationConfig::for_testing("a"));
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (mut engine, feed, _) = engine(MigrationConfig::for_testing("a"));
        assert!(!engine.health_check().ready);

        feed.add_partition("p-0").await;
        engine.start().await.unwrap();
        let health = engine.health_check();
        assert!(health.ready);
        assert!(health.healthy);
        assert_eq!(health.owned_partitions, 1);
        engine.shutdown().await;
    }
}
