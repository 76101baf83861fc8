// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed lease store.
//!
//! Every instance of a migration points at the same database file. The
//! compare-and-swap is a single conditional `UPDATE ... RETURNING` (or
//! `INSERT ... ON CONFLICT DO NOTHING RETURNING` for creation), so SQLite's
//! write lock makes each swap atomic.
//!
//! # Layout
//!
//! ```text
//! {container}          (processor, partition_id) → owner, continuation, expires_at, version
//! {container}_skipped  append-only log of permanently rejected records
//! ```
//!
//! Rows are namespaced by processor name, so several migrations can share one
//! lease container without seeing each other's partitions.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when several instances write
//! at once. Statements are retried with exponential backoff before the error
//! reaches the caller.

use super::{
    now_ms, BoxFuture, ContinuationToken, Lease, LeaseOutcome, LeaseRequest, LeaseStore, ReleaseOutcome,
    SkippedRecord,
};
use crate::config::{is_valid_identifier, LeaseConfig};
use crate::error::{MigrationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::lease_store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

type LeaseRow = (String, Option<String>, Option<String>, i64, i64);
type SkippedRow = (String, String, Option<String>, String, i64);

fn lease_from_row((partition_id, owner, continuation, expires_at_ms, version): LeaseRow) -> Lease {
    Lease {
        partition_id,
        owner,
        continuation: continuation.map(ContinuationToken::new),
        expires_at_ms,
        version: version.max(0) as u64,
    }
}

/// Lease store backed by a shared SQLite database.
pub struct SqliteLeaseStore {
    pool: SqlitePool,
    table: String,
    processor: String,
    throughput: Option<u32>,
}

impl SqliteLeaseStore {
    /// Open (creating if missing) the database named in `config`.
    ///
    /// `":memory:"` opens a private in-memory database on a single connection.
    pub async fn open(config: &LeaseConfig, processor_name: &str) -> Result<Self> {
        let path = config.sqlite_path.as_str();
        info!(path = %path, container = %config.container_name, "Opening lease store");

        let pool = if path == ":memory:" {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| MigrationError::Config(format!("Invalid SQLite path: {}", e)))?;
            // Every connection would get its own empty database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
                .map_err(|e| MigrationError::Config(format!("Invalid SQLite path: {}", e)))?
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(Duration::from_secs(5))
                .create_if_missing(true);
            SqlitePoolOptions::new().max_connections(4).connect_with(options).await?
        };

        let mut store = Self::from_pool(pool, &config.container_name, processor_name)?;
        store.throughput = config.throughput;
        Ok(store)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: SqlitePool, container_name: &str, processor_name: &str) -> Result<Self> {
        if !is_valid_identifier(container_name) {
            return Err(MigrationError::Config(format!(
                "lease container name '{}' is not a valid table name",
                container_name
            )));
        }
        Ok(Self {
            pool,
            table: container_name.to_string(),
            processor: processor_name.to_string(),
            throughput: None,
        })
    }

    /// Force flush WAL to the main database file.
    pub async fn checkpoint_wal(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint_wal().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Lease store closed");
    }

    async fn create_lease(&self, request: &LeaseRequest, now: i64) -> Result<LeaseOutcome> {
        let expires_at = expiry(now, request.duration);
        let continuation = request.continuation.as_ref().map(|t| t.as_str().to_string());
        let sql = format!(
            r#"
            INSERT INTO {t} (processor, partition_id, owner, continuation, expires_at, version, updated_at)
            VALUES (?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(processor, partition_id) DO NOTHING
            RETURNING partition_id, owner, continuation, expires_at, version
            "#,
            t = self.table
        );
        let pool = &self.pool;

        let row: Option<LeaseRow> = execute_with_retry("lease_create", || {
            sqlx::query_as::<_, LeaseRow>(&sql)
                .bind(&self.processor)
                .bind(&request.partition_id)
                .bind(&request.owner_id)
                .bind(continuation.as_deref())
                .bind(expires_at)
                .bind(now)
                .fetch_optional(pool)
        })
        .await?;

        Ok(match row {
            Some(row) => LeaseOutcome::Granted(lease_from_row(row)),
            None => LeaseOutcome::Conflict,
        })
    }

    async fn swap_lease(&self, request: &LeaseRequest, expected: u64, now: i64) -> Result<LeaseOutcome> {
        let expires_at = expiry(now, request.duration);
        let continuation = request.continuation.as_ref().map(|t| t.as_str().to_string());
        let expected = i64::try_from(expected).unwrap_or(i64::MAX);
        let sql = format!(
            r#"
            UPDATE {t} SET
                owner = ?,
                continuation = COALESCE(?, continuation),
                expires_at = ?,
                version = version + 1,
                updated_at = ?
            WHERE processor = ? AND partition_id = ? AND version = ?
              AND (owner IS NULL OR owner = ? OR expires_at <= ?)
            RETURNING partition_id, owner, continuation, expires_at, version
            "#,
            t = self.table
        );
        let pool = &self.pool;

        let row: Option<LeaseRow> = execute_with_retry("lease_swap", || {
            sqlx::query_as::<_, LeaseRow>(&sql)
                .bind(&request.owner_id)
                .bind(continuation.as_deref())
                .bind(expires_at)
                .bind(now)
                .bind(&self.processor)
                .bind(&request.partition_id)
                .bind(expected)
                .bind(&request.owner_id)
                .bind(now)
                .fetch_optional(pool)
        })
        .await?;

        Ok(match row {
            Some(row) => LeaseOutcome::Granted(lease_from_row(row)),
            None => LeaseOutcome::Conflict,
        })
    }
}

fn expiry(now: i64, duration: Duration) -> i64 {
    now.saturating_add(duration.as_millis().min(i64::MAX as u128) as i64)
}

impl LeaseStore for SqliteLeaseStore {
    fn initialize(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let leases = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {t} (
                    processor TEXT NOT NULL,
                    partition_id TEXT NOT NULL,
                    owner TEXT,
                    continuation TEXT,
                    expires_at INTEGER NOT NULL DEFAULT 0,
                    version INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (processor, partition_id)
                )
                "#,
                t = self.table
            );
            let skipped = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {t}_skipped (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    processor TEXT NOT NULL,
                    partition_id TEXT NOT NULL,
                    record_id TEXT NOT NULL,
                    partition_key TEXT,
                    reason TEXT NOT NULL,
                    skipped_at INTEGER NOT NULL
                )
                "#,
                t = self.table
            );
            let pool = &self.pool;

            execute_with_retry("lease_init", || sqlx::query(&leases).execute(pool)).await?;
            execute_with_retry("lease_init", || sqlx::query(&skipped).execute(pool)).await?;

            if let Some(throughput) = self.throughput {
                // SQLite has no provisioned throughput.
                debug!(throughput, "Ignoring lease container throughput hint");
            }
            info!(container = %self.table, processor = %self.processor, "Lease container ready");
            Ok(())
        })
    }

    fn acquire_or_renew(&self, request: LeaseRequest) -> BoxFuture<'_, LeaseOutcome> {
        Box::pin(async move {
            let now = now_ms();
            match request.expected_version {
                None => self.create_lease(&request, now).await,
                Some(expected) => self.swap_lease(&request, expected, now).await,
            }
        })
    }

    fn read_all(&self) -> BoxFuture<'_, Vec<Lease>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT partition_id, owner, continuation, expires_at, version FROM {t} \
                 WHERE processor = ? ORDER BY partition_id",
                t = self.table
            );
            let pool = &self.pool;
            let rows: Vec<LeaseRow> = execute_with_retry("lease_read_all", || {
                sqlx::query_as::<_, LeaseRow>(&sql).bind(&self.processor).fetch_all(pool)
            })
            .await?;
            Ok(rows.into_iter().map(lease_from_row).collect())
        })
    }

    fn release<'a>(
        &'a self,
        partition_id: &'a str,
        owner_id: &'a str,
        expected_version: u64,
    ) -> BoxFuture<'a, ReleaseOutcome> {
        Box::pin(async move {
            let sql = format!(
                r#"
                UPDATE {t} SET owner = NULL, expires_at = 0, version = version + 1, updated_at = ?
                WHERE processor = ? AND partition_id = ? AND version = ? AND owner = ?
                "#,
                t = self.table
            );
            let expected = i64::try_from(expected_version).unwrap_or(i64::MAX);
            let now = now_ms();
            let pool = &self.pool;

            let result = execute_with_retry("lease_release", || {
                sqlx::query(&sql)
                    .bind(now)
                    .bind(&self.processor)
                    .bind(partition_id)
                    .bind(expected)
                    .bind(owner_id)
                    .execute(pool)
            })
            .await?;

            Ok(if result.rows_affected() == 1 {
                ReleaseOutcome::Released
            } else {
                ReleaseOutcome::Conflict
            })
        })
    }

    fn record_skip(&self, record: SkippedRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO {t}_skipped (processor, partition_id, record_id, partition_key, reason, skipped_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                t = self.table
            );
            let pool = &self.pool;
            execute_with_retry("lease_record_skip", || {
                sqlx::query(&sql)
                    .bind(&self.processor)
                    .bind(&record.partition_id)
                    .bind(&record.record_id)
                    .bind(record.partition_key.as_deref())
                    .bind(&record.reason)
                    .bind(record.skipped_at_ms)
                    .execute(pool)
            })
            .await?;
            Ok(())
        })
    }

    fn skipped(&self) -> BoxFuture<'_, Vec<SkippedRecord>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT partition_id, record_id, partition_key, reason, skipped_at FROM {t}_skipped \
                 WHERE processor = ? ORDER BY id",
                t = self.table
            );
            let pool = &self.pool;
            let rows = execute_with_retry("lease_skipped", || {
                sqlx::query_as::<_, SkippedRow>(&sql).bind(&self.processor).fetch_all(pool)
            })
            .await?;
            Ok(rows
                .into_iter()
                .map(|(partition_id, record_id, partition_key, reason, skipped_at_ms)| SkippedRecord {
                    partition_id,
                    record_id,
                    partition_key,
                    reason,
                    skipped_at_ms,
                })
                .collect())
        })
    }
}
