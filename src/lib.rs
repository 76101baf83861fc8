//! # Change-Feed Migrator
//!
//! Continuously copies records from a partitioned source container to a
//! destination container by replaying the source's change stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          changefeed-migrator                              │
//! │                                                                           │
//! │  ┌──────────────┐   owns   ┌───────────────┐   ┌───────────────────────┐  │
//! │  │ Partition    │─────────►│ ReplayWorker  │──►│ BatchApplier          │  │
//! │  │ Coordinator  │ (1/part) │ read → apply  │   │ idempotent upserts    │  │
//! │  └──────────────┘          │ → checkpoint  │   └───────────────────────┘  │
//! │     │      ▲               └───────────────┘             │                │
//! │     ▼      │ CAS                  │ read                 ▼                │
//! │  ┌──────────────┐          ┌───────────────┐   ┌───────────────────────┐  │
//! │  │ LeaseStore   │          │ ChangeFeed    │   │ DestinationWriter     │  │
//! │  │ (SQLite)     │          │ (Redis)       │   │ (Redis)               │  │
//! │  └──────────────┘          └───────────────┘   └───────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **At-least-once**: a partition's continuation token is checkpointed only
//!   after every record of a batch is acknowledged by the destination.
//! - **Idempotent**: upserts keyed by `(partition key, id)` make redelivery
//!   harmless, so the destination converges to the latest snapshot.
//! - **Exclusive ownership**: leases are mutated by compare-and-swap on a
//!   version, so at most one instance replays a partition at a time (modulo a
//!   brief overlap at expiry, which idempotence absorbs).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use changefeed_migrator::{MemoryChangeFeed, MemoryDestination, MemoryLeaseStore};
//! use changefeed_migrator::{MigrationConfig, MigrationEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = MigrationConfig::for_testing("worker-1");
//!     let mut engine = MigrationEngine::new(
//!         config,
//!         Arc::new(MemoryChangeFeed::new()),
//!         Arc::new(MemoryLeaseStore::new()),
//!         Arc::new(MemoryDestination::default()),
//!     );
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs until shutdown
//!     engine.shutdown().await;
//! }
//! ```

pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod destination;
pub mod error;
pub mod feed;
pub mod lease;
pub mod metrics;
pub mod resilience;

// Re-exports for convenience
pub use batch::{ApplyOutcome, BatchApplier};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use config::{LeaseConfig, MigrationConfig, MigrationTarget, ReplayConfig};
pub use coordinator::{EngineState, HealthCheck, MigrationEngine, PartitionState, PartitionTable};
pub use destination::{DestinationWriter, MemoryDestination, RedisDestination, WriteError};
pub use error::{MigrationError, Result};
pub use feed::{ChangeBatch, ChangeFeed, ChangeRecord, ChangeStreamReader, MemoryChangeFeed, ReadResult, RedisChangeFeed};
pub use lease::{
    ContinuationToken, Lease, LeaseOutcome, LeaseRequest, LeaseStore, MemoryLeaseStore, ReleaseOutcome,
    SkippedRecord, SqliteLeaseStore,
};
