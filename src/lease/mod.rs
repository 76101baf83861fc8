// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lease records and the lease store abstraction.
//!
//! A lease says which instance owns a source partition, until when, and where
//! in the change stream that partition's replay has durably got to. Every
//! mutation is a compare-and-swap on the record's `version`, so two instances
//! racing for the same partition cannot both win.
//!
//! # Lease Lifecycle
//!
//! ```text
//!   (no record) ──create──▶ owned(v1) ──renew/checkpoint──▶ owned(v2) ...
//!                              │                               │
//!                              │ release                       │ not renewed
//!                              ▼                               ▼
//!                          unowned(vN) ◀──────────────── expired(vN)
//!                              │                               │
//!                              └──────── acquire (any owner) ──┘
//! ```
//!
//! The continuation token survives release and expiry: whoever acquires the
//! lease next resumes from it.
//!
//! # Implementations
//!
//! - [`SqliteLeaseStore`]: durable, shared by every instance pointing at the same file
//! - [`MemoryLeaseStore`]: in-process, for tests and single-process runs

mod memory;
mod sqlite;

pub use memory::MemoryLeaseStore;
pub use sqlite::SqliteLeaseStore;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future type for lease store and adapter trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Current wall-clock time in epoch milliseconds.
///
/// Lease expiry is compared across instances, so it has to be wall-clock,
/// not `Instant`.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Opaque position in a partition's change stream.
///
/// Only the source adapter that produced a token can interpret it. Everyone
/// else stores it and hands it back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A lease record as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub partition_id: String,
    /// Current owner, `None` after a clean release.
    pub owner: Option<String>,
    /// Last durably checkpointed position. `None` means "from the beginning".
    pub continuation: Option<ContinuationToken>,
    /// Epoch millis after which the lease may be taken by anyone.
    pub expires_at_ms: i64,
    /// Bumped on every successful mutation.
    pub version: u64,
}

impl Lease {
    /// Whether someone holds this lease at `now_ms`.
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.owner.is_some() && self.expires_at_ms > now_ms
    }

    /// Whether `owner_id` holds this lease at `now_ms`.
    pub fn is_held_by(&self, owner_id: &str, now_ms: i64) -> bool {
        self.is_live(now_ms) && self.owner.as_deref() == Some(owner_id)
    }

    /// Whether `owner_id` may acquire this lease at `now_ms`.
    ///
    /// True if it is unowned, expired, or already held by `owner_id`
    /// (a restarted instance reclaiming its own lease).
    pub fn is_available_to(&self, owner_id: &str, now_ms: i64) -> bool {
        !self.is_live(now_ms) || self.owner.as_deref() == Some(owner_id)
    }
}

/// A compare-and-swap request against one lease record.
#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub partition_id: String,
    pub owner_id: String,
    /// Version the caller last saw. `None` means "create; no record exists".
    pub expected_version: Option<u64>,
    /// New continuation token. `None` keeps the stored one.
    pub continuation: Option<ContinuationToken>,
    /// Lease validity from now.
    pub duration: Duration,
}

impl LeaseRequest {
    /// Create the first lease record for a newly discovered partition.
    pub fn create(partition_id: impl Into<String>, owner_id: impl Into<String>, duration: Duration) -> Self {
        Self {
            partition_id: partition_id.into(),
            owner_id: owner_id.into(),
            expected_version: None,
            continuation: None,
            duration,
        }
    }

    /// Acquire or renew an existing lease at the version the caller observed.
    pub fn claim(lease: &Lease, owner_id: impl Into<String>, duration: Duration) -> Self {
        Self {
            partition_id: lease.partition_id.clone(),
            owner_id: owner_id.into(),
            expected_version: Some(lease.version),
            continuation: None,
            duration,
        }
    }

    /// Also advance the continuation token (a checkpoint).
    pub fn with_continuation(mut self, token: ContinuationToken) -> Self {
        self.continuation = Some(token);
        self
    }
}

/// Result of [`LeaseStore::acquire_or_renew`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The swap happened; this is the record as now stored.
    Granted(Lease),
    /// Someone else changed the record first, or it is live and owned by another instance.
    Conflict,
}

/// Result of [`LeaseStore::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    Conflict,
}

/// A change record that was permanently rejected and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub partition_id: String,
    /// Record id, or the raw entry id for records that could not be parsed.
    pub record_id: String,
    pub partition_key: Option<String>,
    pub reason: String,
    pub skipped_at_ms: i64,
}

/// Durable, shared lease storage with per-record compare-and-swap.
///
/// Conflicts are outcomes, not errors: `Err` means the store itself could not
/// be reached or failed.
pub trait LeaseStore: Send + Sync {
    /// Create the lease container if it does not exist. Idempotent.
    fn initialize(&self) -> BoxFuture<'_, ()>;

    /// Conditionally create, acquire, renew or checkpoint one lease.
    ///
    /// Succeeds only if the record's version equals `expected_version` (or,
    /// for `None`, no record exists yet) and the lease is not live under a
    /// different owner.
    fn acquire_or_renew(&self, request: LeaseRequest) -> BoxFuture<'_, LeaseOutcome>;

    /// Every lease record in this processor's namespace.
    fn read_all(&self) -> BoxFuture<'_, Vec<Lease>>;

    /// Clear ownership, keeping the continuation token.
    fn release<'a>(
        &'a self,
        partition_id: &'a str,
        owner_id: &'a str,
        expected_version: u64,
    ) -> BoxFuture<'a, ReleaseOutcome>;

    /// Durably note a permanently rejected record.
    fn record_skip(&self, record: SkippedRecord) -> BoxFuture<'_, ()>;

    /// Every skipped record noted so far, oldest first.
    fn skipped(&self) -> BoxFuture<'_, Vec<SkippedRecord>>;
}

/// Apply the compare-and-swap rule to a record.
///
/// Returns the record to store on success, `None` on conflict. Every store
/// implementation must agree with this function.
pub fn evaluate(current: Option<&Lease>, request: &LeaseRequest, now_ms: i64) -> Option<Lease> {
    let expires_at_ms = now_ms.saturating_add(request.duration.as_millis().min(i64::MAX as u128) as i64);

    match (current, request.expected_version) {
        (None, None) => Some(Lease {
            partition_id: request.partition_id.clone(),
            owner: Some(request.owner_id.clone()),
            continuation: request.continuation.clone(),
            expires_at_ms,
            version: 1,
        }),
        (None, Some(_)) | (Some(_), None) => None,
        (Some(lease), Some(expected)) => {
            if lease.version != expected || !lease.is_available_to(&request.owner_id, now_ms) {
                return None;
            }
            Some(Lease {
                partition_id: lease.partition_id.clone(),
                owner: Some(request.owner_id.clone()),
                continuation: request.continuation.clone().or_else(|| lease.continuation.clone()),
                expires_at_ms,
                version: lease.version + 1,
            })
        }
    }
}

/// Apply the release rule to a record. `None` on conflict.
pub fn evaluate_release(current: Option<&Lease>, owner_id: &str, expected_version: u64) -> Option<Lease> {
    let lease = current?;
    if lease.version != expected_version || lease.owner.as_deref() != Some(owner_id) {
        return None;
    }
    Some(Lease {
        owner: None,
        expires_at_ms: 0,
        version: lease.version + 1,
        ..lease.clone()
    })
}
