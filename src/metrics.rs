//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Lease ownership and conflicts
//! - Change stream reads and lag
//! - Destination writes and skipped records
//! - Checkpoints
//! - Circuit breaker state
//!
//! The binary installs no exporter; embedders wire up whichever `metrics`
//! recorder they use.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `migration_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Lease Metrics
// =============================================================================

/// Record a lease acquisition (fresh, takeover or reclaim).
pub fn record_lease_acquired(partition_id: &str, takeover: bool) {
    let kind = if takeover { "takeover" } else { "fresh" };
    counter!("migration_lease_acquired_total", "partition_id" => partition_id.to_string(), "kind" => kind)
        .increment(1);
}

/// Record a lost compare-and-swap on the lease store.
pub fn record_lease_conflict(partition_id: &str, operation: &str) {
    counter!(
        "migration_lease_conflicts_total",
        "partition_id" => partition_id.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a lease this instance lost to another owner.
pub fn record_lease_lost(partition_id: &str) {
    counter!("migration_lease_lost_total", "partition_id" => partition_id.to_string()).increment(1);
}

/// Record a lease released on clean stop.
pub fn record_lease_released(partition_id: &str) {
    counter!("migration_lease_released_total", "partition_id" => partition_id.to_string()).increment(1);
}

/// Record lease store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn lease_store_retries_total(operation: &str) {
    counter!("migration_lease_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Gauge for number of partitions this instance currently owns.
pub fn set_owned_partitions(count: usize) {
    gauge!("migration_owned_partitions").set(count as f64);
}

// =============================================================================
// Source Metrics
// =============================================================================

/// Record a change stream read.
pub fn record_source_read(partition_id: &str, records: usize, malformed: usize, duration: Duration) {
    let partition = partition_id.to_string();
    counter!("migration_source_reads_total", "partition_id" => partition.clone()).increment(1);
    if records > 0 {
        counter!("migration_source_records_read_total", "partition_id" => partition.clone())
            .increment(records as u64);
    }
    if malformed > 0 {
        counter!("migration_source_malformed_total", "partition_id" => partition.clone())
            .increment(malformed as u64);
    }
    histogram!("migration_source_read_duration_seconds", "partition_id" => partition)
        .record(duration.as_secs_f64());
}

/// Record a change stream read error that exhausted its retries.
pub fn record_source_read_error(partition_id: &str) {
    counter!("migration_source_read_errors_total", "partition_id" => partition_id.to_string())
        .increment(1);
}

/// Record replication lag in milliseconds (age of the newest unread change).
pub fn record_partition_lag_ms(partition_id: &str, lag_ms: u64) {
    gauge!("migration_partition_lag_ms", "partition_id" => partition_id.to_string()).set(lag_ms as f64);
}

// =============================================================================
// Destination Metrics
// =============================================================================

/// Record one upsert attempt outcome (`applied`, `retried`, `skipped`, `failed`).
pub fn record_upsert(outcome: &str) {
    counter!("migration_upserts_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a batch applied to the destination.
pub fn record_batch_applied(
    partition_id: &str,
    read: usize,
    applied: usize,
    coalesced: usize,
    skipped: usize,
    duration: Duration,
) {
    let partition = partition_id.to_string();

    counter!("migration_batch_records_total", "partition_id" => partition.clone())
        .increment(read as u64);
    counter!("migration_batch_applied_total", "partition_id" => partition.clone())
        .increment(applied as u64);
    if coalesced > 0 {
        counter!("migration_batch_coalesced_total", "partition_id" => partition.clone())
            .increment(coalesced as u64);
    }
    if skipped > 0 {
        counter!("migration_batch_skipped_total", "partition_id" => partition.clone())
            .increment(skipped as u64);
    }

    histogram!("migration_batch_apply_duration_seconds", "partition_id" => partition.clone())
        .record(duration.as_secs_f64());
    histogram!("migration_batch_size", "partition_id" => partition).record(read as f64);
}

// =============================================================================
// Checkpoint / Partition Metrics
// =============================================================================

/// Record a checkpoint write.
pub fn record_checkpoint(partition_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("migration_checkpoints_total", "partition_id" => partition_id.to_string(), "status" => status)
        .increment(1);
}

/// Record a partition entering the Failed state.
pub fn record_partition_failure(partition_id: &str) {
    counter!("migration_partition_failures_total", "partition_id" => partition_id.to_string())
        .increment(1);
}

/// Record a partition whose source reported end-of-partition.
pub fn record_partition_ended(partition_id: &str) {
    counter!("migration_partition_ended_total", "partition_id" => partition_id.to_string()).increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("migration_engine_state").set(value);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "migration_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// 1 while the breaker is rejecting calls, 0 otherwise.
pub fn set_circuit_open(circuit_name: &str, open: bool) {
    gauge!("migration_circuit_open", "circuit" => circuit_name.to_string()).set(if open { 1.0 } else { 0.0 });
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!("migration_circuit_rejections_total", "circuit" => circuit_name.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics crate uses global state and no recorder is installed here,
    // so these only check the functions accept edge-case inputs.

    #[test]
    fn test_lease_metrics() {
        record_lease_acquired("p-0", false);
        record_lease_acquired("p-0", true);
        record_lease_conflict("p-0", "checkpoint");
        record_lease_lost("p-0");
        record_lease_released("p-0");
        lease_store_retries_total("acquire_or_renew");
        set_owned_partitions(0);
        set_owned_partitions(12);
    }

    #[test]
    fn test_source_metrics() {
        record_source_read("p-0", 100, 0, Duration::from_millis(5));
        record_source_read("p-0", 0, 3, Duration::ZERO);
        record_source_read_error("");
        record_partition_lag_ms("p-0", 0);
    }

    #[test]
    fn test_destination_metrics() {
        record_upsert("applied");
        record_upsert("skipped");
        record_batch_applied("p-1", 10, 8, 1, 1, Duration::from_millis(20));
        record_batch_applied("p-1", 0, 0, 0, 0, Duration::ZERO);
    }

    #[test]
    fn test_partition_metrics() {
        record_checkpoint("p-2", true);
        record_checkpoint("p-2", false);
        record_partition_failure("p-2");
        record_partition_ended("p-2");
    }

    #[test]
    fn test_set_engine_state_all_states() {
        for state in ["Created", "Starting", "Running", "ShuttingDown", "Stopped", "Failed", "Bogus"] {
            set_engine_state(state);
        }
    }

    #[test]
    fn test_circuit_metrics() {
        record_circuit_call("destination", "success");
        record_circuit_call("destination", "rejected");
        set_circuit_open("destination", true);
        set_circuit_open("destination", false);
        record_circuit_rejection("destination");
    }
}
