//! Shared test utilities for pipeline, chaos and integration tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - A lease store wrapper with checkpoint failure injection
//! - Engine and record fixtures

#![allow(dead_code)]

pub mod containers;

pub use containers::*;

use changefeed_migrator::lease::BoxFuture;
use changefeed_migrator::{
    ChangeRecord, Lease, LeaseOutcome, LeaseRequest, LeaseStore, MemoryChangeFeed, MemoryDestination,
    MemoryLeaseStore, MigrationConfig, MigrationEngine, MigrationError, ReleaseOutcome, SkippedRecord,
};
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A record snapshot under partition key `t1`.
pub fn rec(id: &str, version: i64) -> ChangeRecord {
    ChangeRecord::new(id, "t1", json!({"id": id, "pk": "t1", "v": version}))
}

/// Lease store that fails checkpoints on demand.
///
/// A failed checkpoint looks exactly like a process dying between applying a
/// batch and persisting its token: the writes happened, the token did not move.
#[derive(Clone, Default)]
pub struct FlakyLeaseStore {
    pub inner: MemoryLeaseStore,
    failing_checkpoints: Arc<AtomicUsize>,
    checkpoints: Arc<AtomicUsize>,
}

impl FlakyLeaseStore {
    pub fn new(inner: MemoryLeaseStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    /// Fail the next `n` checkpoints with a non-retryable error.
    pub fn fail_next_checkpoints(&self, n: usize) {
        self.failing_checkpoints.store(n, Ordering::SeqCst);
    }

    /// Successful checkpoints so far.
    pub fn checkpoints(&self) -> usize {
        self.checkpoints.load(Ordering::SeqCst)
    }
}

impl LeaseStore for FlakyLeaseStore {
    fn initialize(&self) -> BoxFuture<'_, ()> {
        self.inner.initialize()
    }

    fn acquire_or_renew(&self, request: LeaseRequest) -> BoxFuture<'_, LeaseOutcome> {
        Box::pin(async move {
            if request.continuation.is_some() {
                let failing = self
                    .failing_checkpoints
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                if failing.is_ok() {
                    return Err(MigrationError::Internal("injected checkpoint crash".to_string()));
                }
            }
            let outcome = self.inner.acquire_or_renew(request.clone()).await?;
            if request.continuation.is_some() && matches!(outcome, LeaseOutcome::Granted(_)) {
                self.checkpoints.fetch_add(1, Ordering::SeqCst);
            }
            Ok(outcome)
        })
    }

    fn read_all(&self) -> BoxFuture<'_, Vec<Lease>> {
        self.inner.read_all()
    }

    fn release<'a>(
        &'a self,
        partition_id: &'a str,
        owner_id: &'a str,
        expected_version: u64,
    ) -> BoxFuture<'a, ReleaseOutcome> {
        self.inner.release(partition_id, owner_id, expected_version)
    }

    fn record_skip(&self, record: SkippedRecord) -> BoxFuture<'_, ()> {
        self.inner.record_skip(record)
    }

    fn skipped(&self) -> BoxFuture<'_, Vec<SkippedRecord>> {
        self.inner.skipped()
    }
}

/// Build an engine over shared in-memory adapters.
pub fn engine(
    instance: &str,
    feed: &MemoryChangeFeed,
    store: Arc<dyn LeaseStore>,
    dest: &MemoryDestination,
) -> MigrationEngine {
    MigrationEngine::new(
        MigrationConfig::for_testing(instance),
        Arc::new(feed.clone()),
        store,
        Arc::new(dest.clone()),
    )
}

/// Poll `check` every 10ms until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
