//! In-process change feed with failure injection.
//!
//! Tokens are decimal offsets into the partition's log. Clones share state,
//! so a test can keep writing to a feed the engine is reading.

use super::{ChangeBatch, ChangeFeed, ChangeRecord, MalformedEntry, ReadResult};
use crate::error::MigrationError;
use crate::lease::{BoxFuture, ContinuationToken};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
enum Entry {
    Record(ChangeRecord),
    Malformed(String),
}

#[derive(Debug, Default)]
struct PartitionLog {
    entries: Vec<Entry>,
    sealed: bool,
    listed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    partitions: BTreeMap<String, PartitionLog>,
    failing_reads: usize,
    reads: u64,
    lag_estimates: u64,
}

/// Change feed held in memory.
#[derive(Clone, Default)]
pub struct MemoryChangeFeed {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a partition visible without writing to it.
    pub async fn add_partition(&self, partition_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.partitions.entry(partition_id.to_string()).or_default().listed = true;
    }

    /// Hide a partition from listings. Its log stays readable.
    pub async fn remove_partition(&self, partition_id: &str) {
        if let Some(log) = self.inner.lock().await.partitions.get_mut(partition_id) {
            log.listed = false;
        }
    }

    /// Append a record snapshot.
    pub async fn push(&self, partition_id: &str, record: ChangeRecord) {
        self.append(partition_id, Entry::Record(record)).await;
    }

    /// Append an entry that cannot be parsed.
    pub async fn push_malformed(&self, partition_id: &str, reason: &str) {
        self.append(partition_id, Entry::Malformed(reason.to_string())).await;
    }

    /// Seal a partition: readers get `EndOfPartition` once they reach the end.
    pub async fn seal(&self, partition_id: &str) {
        let mut inner = self.inner.lock().await;
        let log = inner.partitions.entry(partition_id.to_string()).or_default();
        log.listed = true;
        log.sealed = true;
    }

    /// Lag estimates requested so far.
    pub async fn lag_estimates(&self) -> u64 {
        self.inner.lock().await.lag_estimates
    }

    /// Fail the next `n` reads with a retryable error.
    pub async fn fail_next_reads(&self, n: usize) {
        self.inner.lock().await.failing_reads = n;
    }

    /// Number of entries written to a partition so far.
    pub async fn len(&self, partition_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .partitions
            .get(partition_id)
            .map(|log| log.entries.len())
            .unwrap_or(0)
    }

    /// Total `read_batch` calls served (including injected failures).
    pub async fn reads(&self) -> u64 {
        self.inner.lock().await.reads
    }

    async fn append(&self, partition_id: &str, entry: Entry) {
        let mut inner = self.inner.lock().await;
        let log = inner.partitions.entry(partition_id.to_string()).or_default();
        log.listed = true;
        log.entries.push(entry);
    }
}

fn parse_offset(token: Option<&ContinuationToken>) -> crate::Result<usize> {
    match token {
        None => Ok(0),
        Some(t) => t
            .as_str()
            .parse()
            .map_err(|_| MigrationError::StreamParse(format!("not a memory feed token: '{}'", t))),
    }
}

impl ChangeFeed for MemoryChangeFeed {
    fn list_partitions(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            Ok(inner
                .partitions
                .iter()
                .filter(|(_, log)| log.listed)
                .map(|(id, _)| id.clone())
                .collect())
        })
    }

    fn read_batch<'a>(
        &'a self,
        partition_id: &'a str,
        continuation: Option<&'a ContinuationToken>,
        max_batch_size: usize,
    ) -> BoxFuture<'a, ReadResult> {
        Box::pin(async move {
            let offset = parse_offset(continuation)?;
            let mut inner = self.inner.lock().await;
            inner.reads += 1;

            if inner.failing_reads > 0 {
                inner.failing_reads -= 1;
                return Err(MigrationError::source_read(partition_id, "injected read failure"));
            }

            let Some(log) = inner.partitions.get(partition_id) else {
                return Ok(ReadResult::NoNewChanges);
            };

            if offset >= log.entries.len() {
                return Ok(if log.sealed {
                    ReadResult::EndOfPartition
                } else {
                    ReadResult::NoNewChanges
                });
            }

            let end = (offset + max_batch_size.max(1)).min(log.entries.len());
            let mut records = Vec::new();
            let mut malformed = Vec::new();
            for (position, entry) in log.entries[offset..end].iter().enumerate() {
                match entry {
                    Entry::Record(record) => records.push(record.clone()),
                    Entry::Malformed(reason) => malformed.push(MalformedEntry {
                        entry_id: (offset + position).to_string(),
                        position,
                        reason: reason.clone(),
                    }),
                }
            }

            Ok(ReadResult::Batch(ChangeBatch {
                records,
                malformed,
                next_token: ContinuationToken::new(end.to_string()),
            }))
        })
    }

    fn estimate_lag<'a>(
        &'a self,
        partition_id: &'a str,
        continuation: Option<&'a ContinuationToken>,
    ) -> BoxFuture<'a, Option<u64>> {
        // Measured in entries, not milliseconds; there are no timestamps here.
        Box::pin(async move {
            self.inner.lock().await.lag_estimates += 1;
            let offset = parse_offset(continuation)?;
            let len = self.len(partition_id).await;
            Ok(Some(len.saturating_sub(offset) as u64))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, v: i64) -> ChangeRecord {
        ChangeRecord::new(id, "pk", json!({"id": id, "v": v}))
    }

    fn batch(result: ReadResult) -> ChangeBatch {
        match result {
            ReadResult::Batch(b) => b,
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reads_in_order_with_tokens() {
        let feed = MemoryChangeFeed::new();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            feed.push("p-0", record(id, i as i64)).await;
        }

        let first = batch(feed.read_batch("p-0", None, 2).await.unwrap());
        assert_eq!(first.records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(first.next_token.as_str(), "2");

        let second = batch(feed.read_batch("p-0", Some(&first.next_token), 2).await.unwrap());
        assert_eq!(second.records.len(), 1);

        let third = feed.read_batch("p-0", Some(&second.next_token), 2).await.unwrap();
        assert_eq!(third, ReadResult::NoNewChanges);
    }

    #[tokio::test]
    async fn test_sealed_partition_ends() {
        let feed = MemoryChangeFeed::new();
        feed.push("p-0", record("a", 1)).await;
        feed.seal("p-0").await;

        let first = batch(feed.read_batch("p-0", None, 10).await.unwrap());
        let end = feed.read_batch("p-0", Some(&first.next_token), 10).await.unwrap();
        assert_eq!(end, ReadResult::EndOfPartition);
    }

    #[tokio::test]
    async fn test_malformed_entries_reported_with_position() {
        let feed = MemoryChangeFeed::new();
        feed.push("p-0", record("a", 1)).await;
        feed.push_malformed("p-0", "bad json").await;

        let b = batch(feed.read_batch("p-0", None, 10).await.unwrap());
        assert_eq!(b.records.len(), 1);
        assert_eq!(b.malformed.len(), 1);
        assert_eq!(b.malformed[0].position, 1);
        assert_eq!(b.len(), 2);
    }

    #[tokio::test]
    async fn test_removed_partition_not_listed_but_readable() {
        let feed = MemoryChangeFeed::new();
        feed.push("p-0", record("a", 1)).await;
        feed.add_partition("p-1").await;
        feed.remove_partition("p-0").await;

        assert_eq!(feed.list_partitions().await.unwrap(), vec!["p-1"]);
        assert!(matches!(feed.read_batch("p-0", None, 10).await.unwrap(), ReadResult::Batch(_)));
    }

    #[tokio::test]
    async fn test_bad_token_is_parse_error() {
        let feed = MemoryChangeFeed::new();
        let token = ContinuationToken::new("1700000000000-0");
        let err = feed.read_batch("p-0", Some(&token), 10).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_lag_in_entries() {
        let feed = MemoryChangeFeed::new();
        for i in 0..5 {
            feed.push("p-0", record("a", i)).await;
        }
        let token = ContinuationToken::new("3");
        assert_eq!(feed.estimate_lag("p-0", Some(&token)).await.unwrap(), Some(2));
    }
}
