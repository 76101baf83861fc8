//! In-process destination with failure injection.

use super::{prepare_record, DestinationWriter, WriteError, WriteFuture};
use crate::config::MigrationTarget;
use crate::error::MigrationError;
use crate::feed::ChangeRecord;
use crate::lease::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    records: BTreeMap<(String, String), Value>,
    partition_key_path: Option<String>,
    writes: u64,
    failing_writes: usize,
    rejected_ids: HashSet<String>,
    write_delay: Duration,
}

/// Destination held in memory. Clones share state.
#[derive(Clone)]
pub struct MemoryDestination {
    inner: Arc<Mutex<Inner>>,
    max_item_bytes: usize,
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new(2 * 1024 * 1024)
    }
}

impl MemoryDestination {
    pub fn new(max_item_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            max_item_bytes,
        }
    }

    /// Fail the next `n` upserts with a retryable error.
    pub async fn fail_next_writes(&self, n: usize) {
        self.inner.lock().await.failing_writes = n;
    }

    /// Reject every upsert of `id` with a fatal error.
    pub async fn reject_id(&self, id: &str) {
        self.inner.lock().await.rejected_ids.insert(id.to_string());
    }

    /// Delay every upsert, to widen race windows in tests.
    pub async fn set_write_delay(&self, delay: Duration) {
        self.inner.lock().await.write_delay = delay;
    }

    pub async fn get(&self, partition_key: &str, id: &str) -> Option<Value> {
        self.inner
            .lock()
            .await
            .records
            .get(&(partition_key.to_string(), id.to_string()))
            .cloned()
    }

    /// Every stored record keyed by `(partition key, id)`.
    pub async fn snapshot(&self) -> BTreeMap<(String, String), Value> {
        self.inner.lock().await.records.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    /// Successful upserts, counting repeats.
    pub async fn writes(&self) -> u64 {
        self.inner.lock().await.writes
    }
}

impl DestinationWriter for MemoryDestination {
    fn ensure_container<'a>(&'a self, target: &'a MigrationTarget) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let wanted = target.destination_key_path();
            match inner.partition_key_path.as_deref() {
                None => {
                    inner.partition_key_path = Some(wanted.to_string());
                    Ok(())
                }
                Some(existing) if existing == wanted => Ok(()),
                Some(existing) => Err(MigrationError::Config(format!(
                    "destination container '{}' exists with partition key path '{}', wanted '{}'",
                    target.destination_container, existing, wanted
                ))),
            }
        })
    }

    fn upsert<'a>(&'a self, record: &'a ChangeRecord) -> WriteFuture<'a> {
        Box::pin(async move {
            prepare_record(record, self.max_item_bytes)?;

            let delay = self.inner.lock().await.write_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut inner = self.inner.lock().await;
            if inner.rejected_ids.contains(&record.id) {
                return Err(WriteError::Fatal(format!("record '{}' rejected", record.id)));
            }
            if inner.failing_writes > 0 {
                inner.failing_writes -= 1;
                return Err(WriteError::Retryable("injected write failure".to_string()));
            }
            inner
                .records
                .insert((record.partition_key.clone(), record.id.clone()), record.payload.clone());
            inner.writes += 1;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let dest = MemoryDestination::default();
        let record = ChangeRecord::new("a", "t1", json!({"v": 1}));
        dest.upsert(&record).await.unwrap();
        dest.upsert(&record).await.unwrap();
        assert_eq!(dest.len().await, 1);
        assert_eq!(dest.writes().await, 2);
        assert_eq!(dest.get("t1", "a").await, Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_same_id_different_partition_key_are_distinct() {
        let dest = MemoryDestination::default();
        dest.upsert(&ChangeRecord::new("a", "t1", json!(1))).await.unwrap();
        dest.upsert(&ChangeRecord::new("a", "t2", json!(2))).await.unwrap();
        assert_eq!(dest.len().await, 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let dest = MemoryDestination::default();
        dest.fail_next_writes(1).await;
        dest.reject_id("bad").await;

        let ok = ChangeRecord::new("a", "t1", json!(1));
        assert!(matches!(dest.upsert(&ok).await, Err(WriteError::Retryable(_))));
        assert!(dest.upsert(&ok).await.is_ok());

        let bad = ChangeRecord::new("bad", "t1", json!(1));
        assert!(matches!(dest.upsert(&bad).await, Err(WriteError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_ensure_container_checks_key_path() {
        let dest = MemoryDestination::default();
        let mut target = MigrationTarget::for_testing("src", "dst");
        dest.ensure_container(&target).await.unwrap();
        dest.ensure_container(&target).await.unwrap();

        target.destination_partition_key_path = Some("/other".to_string());
        assert!(dest.ensure_container(&target).await.is_err());
    }
}
