//! Engine and partition state types.
//!
//! # Engine State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ stores ready, first discovery done
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!
//! Starting ──(config/connectivity error)──→ Failed
//! ```
//!
//! # Partition State Transitions
//!
//! ```text
//! Unowned ──acquire──→ Owned ⇄ Renewing
//!    ↑                   │
//!    │                   ├── clean stop ──────────→ Released
//!    │                   ├── renewal conflict ────→ Expired
//!    │                   ├── worker error ────────→ Failed ──backoff──┐
//!    │                   └── end of partition ────→ Ended             │
//!    └────────────────────────────────────────────────────────────────┘
//! ```

use crate::lease::ContinuationToken;
use std::collections::BTreeMap;

/// State of the migration engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Created but not started.
    Created,

    /// `start()` called: initializing stores, checking the destination and source.
    Starting,

    /// Replaying owned partitions.
    Running,

    /// Draining workers and releasing leases.
    ShuttingDown,

    /// Shut down cleanly. Safe to drop.
    Stopped,

    /// Startup failed. Check logs for the cause.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// This instance's view of one source partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// Known but not owned here.
    Unowned,
    /// Owned, with a running replay worker.
    Owned,
    /// Owned, but the last renewal could not reach the lease store.
    Renewing,
    /// Released after a clean stop.
    Released,
    /// Ownership lost to another instance or to expiry.
    Expired,
    /// Worker failed; waiting out a backoff before this instance retries.
    Failed,
    /// Source partition sealed and fully replayed.
    Ended,
}

impl PartitionState {
    /// Whether this instance currently holds the lease.
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned | Self::Renewing)
    }
}

impl std::fmt::Display for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unowned => "unowned",
            Self::Owned => "owned",
            Self::Renewing => "renewing",
            Self::Released => "released",
            Self::Expired => "expired",
            Self::Failed => "failed",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Published snapshot of partition states, keyed by partition id.
pub type PartitionTable = BTreeMap<String, PartitionStatus>;

/// One partition's entry in the [`PartitionTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStatus {
    pub state: PartitionState,
    /// Last checkpoint this instance saw for the partition.
    pub continuation: Option<ContinuationToken>,
    /// Consecutive local worker failures.
    pub consecutive_failures: u32,
}

impl PartitionStatus {
    pub fn new(state: PartitionState) -> Self {
        Self {
            state,
            continuation: None,
            consecutive_failures: 0,
        }
    }
}

/// Why a replay worker returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stop signal honored between batches.
    Stopped,
    /// End of partition reached and checkpointed.
    Ended,
    /// A checkpoint lost the compare-and-swap.
    LeaseLost,
    /// Unrecoverable error; the last batch was not checkpointed.
    Failed(String),
}

/// Engine health for monitoring endpoints. Collected without I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running and accepting changes.
    pub ready: bool,
    /// Ready, destination circuit not open, and no partition failing.
    pub healthy: bool,
    pub owned_partitions: usize,
    pub failed_partitions: usize,
    pub destination_circuit_open: bool,
    pub partitions: PartitionTable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Starting.to_string(), "Starting");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_partition_state_ownership() {
        assert!(PartitionState::Owned.is_owned());
        assert!(PartitionState::Renewing.is_owned());
        for state in [
            PartitionState::Unowned,
            PartitionState::Released,
            PartitionState::Expired,
            PartitionState::Failed,
            PartitionState::Ended,
        ] {
            assert!(!state.is_owned(), "{}", state);
        }
    }

    #[test]
    fn test_partition_status_defaults() {
        let status = PartitionStatus::new(PartitionState::Unowned);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.continuation.is_none());
    }
}
