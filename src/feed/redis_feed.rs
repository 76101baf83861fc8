// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams change feed.
//!
//! # Key Layout
//!
//! ```text
//! {database}:{container}:partitions     SET of partition ids
//! {database}:{container}:feed:{pid}     STREAM, one entry per change
//! ```
//!
//! # Entry Format
//!
//! | Field  | Required | Meaning |
//! |--------|----------|---------|
//! | `op`   | no       | `UPSERT` (default) or `END` to seal the partition |
//! | `data` | yes*     | JSON document, optionally zstd-compressed |
//! | `id`   | no       | Record id (falls back to the document's `id`) |
//! | `pk`   | no       | Partition key value (falls back to the configured path) |
//! | `hash` | no       | SHA-256 hex of the decompressed `data` |
//!
//! \* not for `END`.
//!
//! Continuation tokens are stream entry ids. Reads are exclusive of the token
//! (`XRANGE key (token + COUNT n`), so a token always names the last entry
//! consumed.
//!
//! # Content Hash Validation
//!
//! When an entry includes a `hash`, the SHA-256 of the decompressed data must
//! match. A mismatch makes the entry malformed; it is skipped and reported,
//! never applied.

use super::{ChangeBatch, ChangeFeed, ChangeRecord, MalformedEntry, ReadResult};
use crate::error::{MigrationError, Result};
use crate::lease::{BoxFuture, ContinuationToken};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::io::Read;
use tracing::{debug, trace, warn};

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Batches larger than this are parsed on the blocking pool.
const PARALLEL_PARSE_THRESHOLD: usize = 16;

type StreamEntries = Vec<(String, HashMap<String, redis::Value>)>;

/// A parsed stream entry.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEntry {
    Upsert(ChangeRecord),
    /// The partition is sealed; nothing after this entry is read.
    End,
}

/// Change feed over Redis streams.
#[derive(Clone)]
pub struct RedisChangeFeed {
    conn: ConnectionManager,
    namespace: String,
    partition_key_path: String,
}

impl RedisChangeFeed {
    /// `namespace` is `{database}:{container}` of the source container.
    pub fn new(conn: ConnectionManager, namespace: impl Into<String>, partition_key_path: impl Into<String>) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
            partition_key_path: partition_key_path.into(),
        }
    }

    pub fn partitions_key(&self) -> String {
        format!("{}:partitions", self.namespace)
    }

    pub fn stream_key(&self, partition_id: &str) -> String {
        format!("{}:feed:{}", self.namespace, partition_id)
    }

    /// Append a record snapshot to a partition (producer side; used by tooling and tests).
    pub async fn append(&self, partition_id: &str, record: &ChangeRecord) -> Result<String> {
        let data = serde_json::to_vec(&record.payload)
            .map_err(|e| MigrationError::Internal(format!("payload serialization: {}", e)))?;
        let hash = compute_content_hash(&data);
        let mut conn = self.conn.clone();

        let _: () = redis::cmd("SADD")
            .arg(self.partitions_key())
            .arg(partition_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| MigrationError::redis("SADD", e))?;

        let id: String = redis::cmd("XADD")
            .arg(self.stream_key(partition_id))
            .arg("*")
            .arg("op")
            .arg("UPSERT")
            .arg("id")
            .arg(&record.id)
            .arg("pk")
            .arg(&record.partition_key)
            .arg("data")
            .arg(data)
            .arg("hash")
            .arg(hash)
            .query_async(&mut conn)
            .await
            .map_err(|e| MigrationError::redis("XADD", e))?;
        Ok(id)
    }

    /// Append an `END` marker, sealing the partition.
    pub async fn seal(&self, partition_id: &str) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(self.stream_key(partition_id))
            .arg("*")
            .arg("op")
            .arg("END")
            .query_async(&mut conn)
            .await
            .map_err(|e| MigrationError::redis("XADD", e))?;
        Ok(id)
    }

    /// Newest entry id in a partition's stream.
    async fn latest_id(&self, partition_id: &str) -> Result<Option<String>> {
        self.edge_id(partition_id, "XREVRANGE", "+", "-").await
    }

    /// Oldest retained entry id in a partition's stream.
    async fn oldest_id(&self, partition_id: &str) -> Result<Option<String>> {
        self.edge_id(partition_id, "XRANGE", "-", "+").await
    }

    async fn edge_id(&self, partition_id: &str, command: &str, from: &str, to: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let result: StreamEntries = redis::cmd(command)
            .arg(self.stream_key(partition_id))
            .arg(from)
            .arg(to)
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| MigrationError::redis(command, e))?;
        Ok(result.into_iter().next().map(|(id, _)| id))
    }

    async fn parse_window(&self, entries: StreamEntries) -> Result<Vec<(String, Result<SourceEntry>)>> {
        if entries.len() <= PARALLEL_PARSE_THRESHOLD {
            return Ok(entries
                .into_iter()
                .map(|(id, fields)| {
                    let parsed = parse_entry(&fields, &self.partition_key_path);
                    (id, parsed)
                })
                .collect());
        }

        // Decompression and hashing are CPU-bound.
        let key_path = self.partition_key_path.clone();
        tokio::task::spawn_blocking(move || {
            entries
                .into_iter()
                .map(|(id, fields)| {
                    let parsed = parse_entry(&fields, &key_path);
                    (id, parsed)
                })
                .collect()
        })
        .await
        .map_err(|e| MigrationError::Internal(format!("entry parse task failed: {}", e)))
    }
}

impl ChangeFeed for RedisChangeFeed {
    fn list_partitions(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let partitions: Vec<String> = redis::cmd("SMEMBERS")
                .arg(self.partitions_key())
                .query_async(&mut conn)
                .await
                .map_err(|e| MigrationError::redis("SMEMBERS", e))?;
            Ok(partitions)
        })
    }

    fn read_batch<'a>(
        &'a self,
        partition_id: &'a str,
        continuation: Option<&'a ContinuationToken>,
        max_batch_size: usize,
    ) -> BoxFuture<'a, ReadResult> {
        Box::pin(async move {
            let start = match continuation {
                None => "-".to_string(),
                Some(token) => format!("({}", token.as_str()),
            };

            let mut conn = self.conn.clone();
            let entries: StreamEntries = redis::cmd("XRANGE")
                .arg(self.stream_key(partition_id))
                .arg(&start)
                .arg("+")
                .arg("COUNT")
                .arg(max_batch_size.max(1))
                .query_async(&mut conn)
                .await
                .map_err(|e| MigrationError::redis("XRANGE", e))?;

            if entries.is_empty() {
                return Ok(ReadResult::NoNewChanges);
            }

            let parsed = self.parse_window(entries).await?;
            let mut records = Vec::new();
            let mut malformed = Vec::new();
            let mut last_id: Option<String> = None;

            for (position, (entry_id, result)) in parsed.into_iter().enumerate() {
                match result {
                    Ok(SourceEntry::Upsert(record)) => {
                        trace!(partition_id = %partition_id, entry_id = %entry_id, record_id = %record.id, "Parsed change");
                        records.push(record);
                    }
                    Ok(SourceEntry::End) => {
                        debug!(partition_id = %partition_id, entry_id = %entry_id, "Reached end-of-partition marker");
                        break;
                    }
                    Err(e) => {
                        warn!(partition_id = %partition_id, entry_id = %entry_id, error = %e, "Malformed change entry");
                        malformed.push(MalformedEntry {
                            entry_id: entry_id.clone(),
                            position,
                            reason: e.to_string(),
                        });
                    }
                }
                last_id = Some(entry_id);
            }

            // `None` only when the very first entry was the END marker.
            let Some(last_id) = last_id else {
                return Ok(ReadResult::EndOfPartition);
            };

            Ok(ReadResult::Batch(ChangeBatch {
                records,
                malformed,
                next_token: ContinuationToken::new(last_id),
            }))
        })
    }

    fn estimate_lag<'a>(
        &'a self,
        partition_id: &'a str,
        continuation: Option<&'a ContinuationToken>,
    ) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async move {
            let Some(latest) = self.latest_id(partition_id).await? else {
                return Ok(Some(0));
            };
            let Some(oldest) = self.oldest_id(partition_id).await? else {
                return Ok(Some(0));
            };

            let cursor = match continuation {
                Some(token) => {
                    if compare_stream_ids(token.as_str(), &oldest) == std::cmp::Ordering::Less {
                        warn!(
                            partition_id = %partition_id,
                            checkpoint = %token,
                            oldest_id = %oldest,
                            "Stream was trimmed past the checkpoint - changes may have been missed"
                        );
                    }
                    token.as_str().to_string()
                }
                None => oldest,
            };
            Ok(calculate_lag_ms(&cursor, &latest))
        })
    }

    fn verify(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let key_type: String = redis::cmd("TYPE")
                .arg(self.partitions_key())
                .query_async(&mut conn)
                .await
                .map_err(|e| MigrationError::redis("TYPE", e))?;
            match key_type.as_str() {
                "set" => Ok(()),
                "none" => {
                    warn!(key = %self.partitions_key(), "Source has no partitions yet");
                    Ok(())
                }
                other => Err(MigrationError::Config(format!(
                    "source partition key {} is a {}, expected a set",
                    self.partitions_key(),
                    other
                ))),
            }
        })
    }
}

/// Parse one stream entry.
///
/// Public so the fuzz targets can exercise it without a Redis connection.
pub fn parse_entry(fields: &HashMap<String, redis::Value>, partition_key_path: &str) -> Result<SourceEntry> {
    let op = match fields.get("op") {
        Some(_) => get_string_field(fields, "op")?.to_ascii_uppercase(),
        None => "UPSERT".to_string(),
    };
    match op.as_str() {
        "UPSERT" | "PUT" => {}
        "END" => return Ok(SourceEntry::End),
        other => return Err(MigrationError::StreamParse(format!("Unknown op type: {}", other))),
    }

    let raw_data = get_bytes_field(fields, "data")?;
    let data = maybe_decompress(&raw_data)?;

    if let Ok(expected_hash) = get_string_field(fields, "hash") {
        let computed = compute_content_hash(&data);
        if !computed.eq_ignore_ascii_case(&expected_hash) {
            return Err(MigrationError::StreamParse(format!(
                "Content hash mismatch: expected {}, got {}",
                expected_hash, computed
            )));
        }
    }

    let payload: serde_json::Value = serde_json::from_slice(&data)
        .map_err(|e| MigrationError::StreamParse(format!("data is not JSON: {}", e)))?;
    if !payload.is_object() {
        return Err(MigrationError::StreamParse("data is not a JSON object".to_string()));
    }

    let id = match get_string_field(fields, "id") {
        Ok(id) => id,
        Err(_) => payload
            .get("id")
            .and_then(super::scalar_to_string)
            .ok_or_else(|| MigrationError::StreamParse("Missing field: id".to_string()))?,
    };
    let partition_key = match get_string_field(fields, "pk") {
        Ok(pk) => pk,
        Err(_) => super::extract_partition_key(&payload, partition_key_path).ok_or_else(|| {
            MigrationError::StreamParse(format!("no pk field and nothing at '{}'", partition_key_path))
        })?,
    };

    Ok(SourceEntry::Upsert(ChangeRecord {
        id,
        partition_key,
        payload,
    }))
}

/// Extract a string field from a stream entry.
fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String> {
    let value = fields
        .get(name)
        .ok_or_else(|| MigrationError::StreamParse(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| MigrationError::StreamParse(format!("Invalid UTF-8 in {}: {}", name, e))),
        redis::Value::SimpleString(s) => Ok(s.clone()),
        _ => Err(MigrationError::StreamParse(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Extract a bytes field from a stream entry.
fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Vec<u8>> {
    let value = fields
        .get(name)
        .ok_or_else(|| MigrationError::StreamParse(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(MigrationError::StreamParse(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder =
            zstd::Decoder::new(data).map_err(|e| MigrationError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| MigrationError::Decompression(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Compute SHA256 content hash as hex string.
pub fn compute_content_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

/// Compare two Redis stream IDs numerically (`{ms}-{seq}`), not lexicographically.
pub fn compare_stream_ids(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> (u64, u64) {
        match s.split_once('-') {
            Some((ts, seq)) => (ts.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
            None => (s.parse().unwrap_or(0), 0),
        }
    };

    parse(a).cmp(&parse(b))
}

/// Parse the timestamp (milliseconds since epoch) from a stream ID.
///
/// Returns `None` for malformed IDs or special cases like "0".
pub fn parse_stream_id_timestamp(stream_id: &str) -> Option<u64> {
    let (ts, seq) = stream_id.split_once('-')?;
    seq.parse::<u64>().ok()?;
    ts.parse().ok()
}

/// Time lag in milliseconds between two stream IDs. 0 if the cursor is ahead.
pub fn calculate_lag_ms(cursor: &str, latest: &str) -> Option<u64> {
    let cursor_ts = parse_stream_id_timestamp(cursor)?;
    let latest_ts = parse_stream_id_timestamp(latest)?;
    Some(latest_ts.saturating_sub(cursor_ts))
}
