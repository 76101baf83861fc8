//! In-process lease store.
//!
//! Clones share state, so several engines in one process (or one test) can
//! compete for the same partitions exactly as they would through SQLite.

use super::{
    evaluate, evaluate_release, now_ms, BoxFuture, Lease, LeaseOutcome, LeaseRequest, LeaseStore,
    ReleaseOutcome, SkippedRecord,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    leases: BTreeMap<String, Lease>,
    skipped: Vec<SkippedRecord>,
}

/// Lease store held in memory. Nothing survives the process.
#[derive(Clone, Default)]
pub struct MemoryLeaseStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a record directly, bypassing compare-and-swap.
    pub async fn put(&self, lease: Lease) {
        self.inner.lock().await.leases.insert(lease.partition_id.clone(), lease);
    }

    /// Read one record.
    pub async fn get(&self, partition_id: &str) -> Option<Lease> {
        self.inner.lock().await.leases.get(partition_id).cloned()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn initialize(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn acquire_or_renew(&self, request: LeaseRequest) -> BoxFuture<'_, LeaseOutcome> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let current = inner.leases.get(&request.partition_id);
            match evaluate(current, &request, now_ms()) {
                Some(updated) => {
                    inner.leases.insert(updated.partition_id.clone(), updated.clone());
                    Ok(LeaseOutcome::Granted(updated))
                }
                None => Ok(LeaseOutcome::Conflict),
            }
        })
    }

    fn read_all(&self) -> BoxFuture<'_, Vec<Lease>> {
        Box::pin(async move { Ok(self.inner.lock().await.leases.values().cloned().collect()) })
    }

    fn release<'a>(
        &'a self,
        partition_id: &'a str,
        owner_id: &'a str,
        expected_version: u64,
    ) -> BoxFuture<'a, ReleaseOutcome> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let current = inner.leases.get(partition_id);
            match evaluate_release(current, owner_id, expected_version) {
                Some(released) => {
                    inner.leases.insert(partition_id.to_string(), released);
                    Ok(ReleaseOutcome::Released)
                }
                None => Ok(ReleaseOutcome::Conflict),
            }
        })
    }

    fn record_skip(&self, record: SkippedRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.inner.lock().await.skipped.push(record);
            Ok(())
        })
    }

    fn skipped(&self) -> BoxFuture<'_, Vec<SkippedRecord>> {
        Box::pin(async move { Ok(self.inner.lock().await.skipped.clone()) })
    }
}
