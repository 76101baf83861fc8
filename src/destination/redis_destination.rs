//! Redis-backed destination container.
//!
//! # Key Layout
//!
//! ```text
//! {database}:{container}:__container__          HASH partition_key_path, throughput
//! {database}:{container}:{len(pk)}:{pk}:{id}    STRING JSON document
//! ```
//!
//! The byte length in front of the partition key makes the key unambiguous even
//! when the partition key or id contain `:`. `SET` replaces the whole value,
//! which is exactly last-write-wins upsert.

use super::{prepare_record, DestinationWriter, WriteError, WriteFuture};
use crate::config::MigrationTarget;
use crate::error::MigrationError;
use crate::feed::ChangeRecord;
use crate::lease::BoxFuture;
use redis::aio::ConnectionManager;
use redis::RedisError;
use tracing::{info, trace, warn};

/// Destination container stored as Redis strings.
#[derive(Clone)]
pub struct RedisDestination {
    conn: ConnectionManager,
    namespace: String,
    max_item_bytes: usize,
}

impl RedisDestination {
    /// `namespace` is `{database}:{container}` of the destination container.
    pub fn new(conn: ConnectionManager, namespace: impl Into<String>, max_item_bytes: usize) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
            max_item_bytes,
        }
    }

    pub fn record_key(&self, partition_key: &str, id: &str) -> String {
        record_key(&self.namespace, partition_key, id)
    }

    fn container_key(&self) -> String {
        format!("{}:__container__", self.namespace)
    }

    /// Read a stored document back.
    pub async fn get(&self, partition_key: &str, id: &str) -> crate::Result<Option<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.record_key(partition_key, id))
            .query_async(&mut conn)
            .await
            .map_err(|e| MigrationError::redis("GET", e))?;
        raw.map(|bytes| {
            serde_json::from_slice(&bytes)
                .map_err(|e| MigrationError::Internal(format!("stored document is not JSON: {}", e)))
        })
        .transpose()
    }
}

/// Key of one destination document.
pub fn record_key(namespace: &str, partition_key: &str, id: &str) -> String {
    format!("{}:{}:{}:{}", namespace, partition_key.len(), partition_key, id)
}

/// Map a failed `SET` to a write outcome.
///
/// Everything a record can be rejected for (id shape, size) is checked by
/// [`prepare_record`] before the command is sent, so a Redis failure is always
/// about the server: failover, auth, memory or network. All of those are
/// retried and, once attempts run out, fail the partition without a checkpoint.
pub fn classify_redis_error(e: &RedisError) -> WriteError {
    if !(e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()) {
        warn!(kind = ?e.kind(), code = e.code().unwrap_or(""), error = %e, "Destination rejected write");
    }
    WriteError::Retryable(e.to_string())
}

impl DestinationWriter for RedisDestination {
    fn ensure_container<'a>(&'a self, target: &'a MigrationTarget) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let wanted = target.destination_key_path();
            let mut conn = self.conn.clone();

            let created: bool = redis::cmd("HSETNX")
                .arg(self.container_key())
                .arg("partition_key_path")
                .arg(wanted)
                .query_async(&mut conn)
                .await
                .map_err(|e| MigrationError::redis("HSETNX", e))?;

            if !created {
                let existing: Option<String> = redis::cmd("HGET")
                    .arg(self.container_key())
                    .arg("partition_key_path")
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| MigrationError::redis("HGET", e))?;
                if existing.as_deref() != Some(wanted) {
                    return Err(MigrationError::Config(format!(
                        "destination container '{}' exists with partition key path '{}', wanted '{}'",
                        target.destination_container,
                        existing.unwrap_or_default(),
                        wanted
                    )));
                }
            }

            if let Some(throughput) = target.destination_throughput {
                let _: () = redis::cmd("HSET")
                    .arg(self.container_key())
                    .arg("throughput")
                    .arg(throughput)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| MigrationError::redis("HSET", e))?;
            }

            info!(
                container = %target.destination_container,
                partition_key_path = %wanted,
                created,
                "Destination container ready"
            );
            Ok(())
        })
    }

    fn upsert<'a>(&'a self, record: &'a ChangeRecord) -> WriteFuture<'a> {
        Box::pin(async move {
            let bytes = prepare_record(record, self.max_item_bytes)?;
            let key = self.record_key(&record.partition_key, &record.id);
            let mut conn = self.conn.clone();

            let _: () = redis::cmd("SET")
                .arg(&key)
                .arg(bytes)
                .query_async(&mut conn)
                .await
                .map_err(|e| classify_redis_error(&e))?;

            trace!(key = %key, "Upserted record");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::ErrorKind;

    #[test]
    fn test_classify_io_error_is_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = RedisError::from(io);
        assert!(classify_redis_error(&err).is_retryable());
    }

    #[test]
    fn test_server_side_errors_are_retryable() {
        let errors = [
            RedisError::from((ErrorKind::ReadOnly, "READONLY")),
            RedisError::from((ErrorKind::AuthenticationFailed, "NOAUTH")),
            RedisError::from((ErrorKind::ResponseError, "ERR")),
            RedisError::from((ErrorKind::TypeError, "WRONGTYPE", "wrong kind of value".to_string())),
            RedisError::from((ErrorKind::BusyLoadingError, "LOADING")),
        ];
        for err in errors {
            assert!(classify_redis_error(&err).is_retryable(), "{:?} should be retried", err.kind());
        }
    }

    #[test]
    fn test_keys_with_separators_do_not_collide() {
        let ns = "db:orders";
        assert_ne!(record_key(ns, "t:1", "a"), record_key(ns, "t", "1:a"));
        assert_ne!(record_key(ns, "", "x:y"), record_key(ns, "x", "y"));
        assert_eq!(record_key(ns, "t1", "o-1"), "db:orders:2:t1:o-1");
    }
}
