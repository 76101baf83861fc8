// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end pipeline tests over the in-memory adapters.
//!
//! Each test drives one or more `MigrationEngine`s against a shared feed,
//! lease store and destination, the way several migrator processes would
//! share real ones.
//!
//! Run with: cargo test --test pipeline_tests -- --nocapture

mod common;

use changefeed_migrator::lease::now_ms;
use changefeed_migrator::{
    ContinuationToken, Lease, LeaseStore, MemoryChangeFeed, MemoryDestination, MemoryLeaseStore,
    MigrationConfig, MigrationEngine, PartitionState, SqliteLeaseStore,
};
use common::{engine, rec, wait_until, FlakyLeaseStore};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn partition_state(engine: &MigrationEngine, partition_id: &str) -> Option<PartitionState> {
    engine.partitions().get(partition_id).map(|s| s.state)
}

async fn wait_for_state(engine: &MigrationEngine, partition_id: &str, state: PartitionState) -> bool {
    wait_until(WAIT, || async move { partition_state(engine, partition_id) == Some(state) }).await
}

// =============================================================================
// Convergence under redelivery
// =============================================================================

/// Test: A batch replayed after a lost checkpoint converges to the latest snapshots
#[tokio::test]
async fn redelivered_batch_converges() {
    let feed = &MemoryChangeFeed::new();
    let dest = &MemoryDestination::default();
    let store = &FlakyLeaseStore::new(MemoryLeaseStore::new());
    store.fail_next_checkpoints(1);

    feed.push("p-0", rec("A", 1)).await;
    feed.push("p-0", rec("B", 1)).await;

    let mut migrator = engine("a", feed, Arc::new(store.clone()), dest);
    migrator.start().await.unwrap();

    // First checkpoint is lost; the batch is applied again before one sticks.
    assert!(wait_until(WAIT, || async move { store.checkpoints() >= 1 }).await);
    assert!(dest.writes().await >= 4, "batch should have been applied twice");

    feed.push("p-0", rec("A", 2)).await;
    assert!(
        wait_until(WAIT, || async move {
            dest.get("t1", "A").await.map(|v| v["v"] == 2).unwrap_or(false)
        })
        .await
    );

    let snapshot = dest.snapshot().await;
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[&("t1".to_string(), "A".to_string())]["v"], 2);
    assert_eq!(snapshot[&("t1".to_string(), "B".to_string())]["v"], 1);

    migrator.shutdown().await;
}

/// Test: Several snapshots of one record in a batch leave only the newest
#[tokio::test]
async fn latest_snapshot_wins_within_batch() {
    let feed = &MemoryChangeFeed::new();
    let dest = &MemoryDestination::default();
    let store = &MemoryLeaseStore::new();

    for v in 1..=5 {
        feed.push("p-0", rec("A", v)).await;
    }
    feed.seal("p-0").await;

    let mut migrator = engine("a", feed, Arc::new(store.clone()), dest);
    migrator.start().await.unwrap();
    assert!(wait_for_state(&migrator, "p-0", PartitionState::Ended).await);

    assert_eq!(dest.get("t1", "A").await.unwrap()["v"], 5);
    assert_eq!(dest.writes().await, 1, "coalescing should leave a single write");

    migrator.shutdown().await;
}

// =============================================================================
// Skips
// =============================================================================

/// Test: Permanently rejected records are skipped, logged, and do not block the partition
#[tokio::test]
async fn fatal_records_are_skipped_and_recorded() {
    let feed = &MemoryChangeFeed::new();
    let dest = &MemoryDestination::default();
    let store = &MemoryLeaseStore::new();

    feed.push("p-0", rec("bad/id", 1)).await;
    feed.push("p-0", rec("good", 1)).await;
    feed.push_malformed("p-0", "payload is not JSON").await;
    feed.push("p-0", rec("also-good", 1)).await;
    feed.seal("p-0").await;

    let mut migrator = engine("a", feed, Arc::new(store.clone()), dest);
    migrator.start().await.unwrap();
    assert!(wait_for_state(&migrator, "p-0", PartitionState::Ended).await);

    assert!(dest.get("t1", "good").await.is_some());
    assert!(dest.get("t1", "also-good").await.is_some());
    assert!(dest.get("t1", "bad/id").await.is_none());

    let skipped = migrator.skipped().await.unwrap();
    assert_eq!(skipped.len(), 2);
    assert_eq!(skipped[0].record_id, "bad/id");
    assert_eq!(skipped[0].partition_key.as_deref(), Some("t1"));
    assert!(skipped[1].reason.contains("malformed"));

    // Skips never hold back the token.
    let lease = store.get("p-0").await.unwrap();
    assert_eq!(lease.continuation, Some(ContinuationToken::new("4")));

    migrator.shutdown().await;
}

// =============================================================================
// Ownership
// =============================================================================

/// Test: Two instances split partitions without ever owning the same one
#[tokio::test]
async fn two_instances_share_partitions() {
    let feed = &MemoryChangeFeed::new();
    let dest = &MemoryDestination::default();
    let store = &MemoryLeaseStore::new();

    let partitions = ["p-0", "p-1", "p-2", "p-3"];
    for pid in partitions {
        feed.add_partition(pid).await;
    }

    let capped = |instance: &str| {
        let mut config = MigrationConfig::for_testing(instance);
        config.lease.max_partitions = Some(2);
        MigrationEngine::new(
            config,
            Arc::new(feed.clone()),
            Arc::new(store.clone()),
            Arc::new(dest.clone()),
        )
    };
    let mut a = capped("a");
    let mut b = capped("b");
    a.start().await.unwrap();
    b.start().await.unwrap();

    let (ra, rb) = (&a, &b);
    assert!(
        wait_until(WAIT, || async move {
            ra.owned_partitions().len() + rb.owned_partitions().len() == partitions.len()
        })
        .await
    );

    let owned_a: BTreeSet<String> = a.owned_partitions().into_iter().collect();
    let owned_b: BTreeSet<String> = b.owned_partitions().into_iter().collect();
    assert!(owned_a.is_disjoint(&owned_b), "{:?} overlaps {:?}", owned_a, owned_b);
    assert_eq!(owned_a.len(), 2);
    assert_eq!(owned_b.len(), 2);

    // Every lease names exactly the instance that reports owning it.
    let now = now_ms();
    for lease in store.read_all().await.unwrap() {
        let holder = lease.owner.as_deref().filter(|_| lease.is_live(now)).unwrap();
        let owned = if holder == "a" { &owned_a } else { &owned_b };
        assert!(owned.contains(&lease.partition_id));
    }

    for (i, pid) in partitions.iter().enumerate() {
        feed.push(pid, rec(&format!("r{}", i), 1)).await;
    }
    assert!(wait_until(WAIT, || async move { dest.len().await == partitions.len() }).await);

    a.shutdown().await;
    b.shutdown().await;
}

/// Test: A lease left behind by a dead instance is taken over after it expires
#[tokio::test]
async fn expired_lease_is_taken_over_from_its_checkpoint() {
    let feed = &MemoryChangeFeed::new();
    let dest = &MemoryDestination::default();
    let store = &MemoryLeaseStore::new();

    feed.push("p-0", rec("before-checkpoint", 1)).await;
    feed.push("p-0", rec("after-checkpoint", 1)).await;

    store
        .put(Lease {
            partition_id: "p-0".to_string(),
            owner: Some("crashed".to_string()),
            continuation: Some(ContinuationToken::new("1")),
            expires_at_ms: now_ms() + 300,
            version: 7,
        })
        .await;

    let mut migrator = engine("b", feed, Arc::new(store.clone()), dest);
    migrator.start().await.unwrap();
    assert!(migrator.owned_partitions().is_empty(), "live lease must not be stolen");

    assert!(wait_until(WAIT, || async move { dest.get("t1", "after-checkpoint").await.is_some() }).await);
    assert!(
        dest.get("t1", "before-checkpoint").await.is_none(),
        "replay should resume from the dead owner's checkpoint"
    );

    let lease = store.get("p-0").await.unwrap();
    assert_eq!(lease.owner.as_deref(), Some("b"));
    assert!(lease.version > 7);

    migrator.shutdown().await;
}

/// Test: A restarted instance resumes from its checkpoint without replaying
#[tokio::test]
async fn restart_resumes_from_checkpoint() {
    let feed = &MemoryChangeFeed::new();
    let dest = &MemoryDestination::default();
    let store = &MemoryLeaseStore::new();

    for i in 0..3 {
        feed.push("p-0", rec(&format!("r{}", i), 1)).await;
    }

    let mut first = engine("a", feed, Arc::new(store.clone()), dest);
    first.start().await.unwrap();
    assert!(
        wait_until(WAIT, || async move {
            store.get("p-0").await.and_then(|l| l.continuation) == Some(ContinuationToken::new("3"))
        })
        .await
    );
    first.shutdown().await;

    // Clean shutdown releases the lease and keeps the token.
    let released = store.get("p-0").await.unwrap();
    assert_eq!(released.owner, None);
    assert_eq!(released.continuation, Some(ContinuationToken::new("3")));
    assert_eq!(dest.writes().await, 3);

    feed.push("p-0", rec("r3", 1)).await;
    feed.push("p-0", rec("r4", 1)).await;

    let mut second = engine("a", feed, Arc::new(store.clone()), dest);
    second.start().await.unwrap();
    assert!(wait_until(WAIT, || async move { dest.len().await == 5 }).await);
    assert_eq!(dest.writes().await, 5, "nothing before the checkpoint is replayed");

    second.shutdown().await;
}

/// Test: New partitions appearing after start are picked up by discovery
#[tokio::test]
async fn partitions_discovered_after_start() {
    let feed = &MemoryChangeFeed::new();
    let dest = &MemoryDestination::default();

    let mut migrator = engine("a", feed, Arc::new(MemoryLeaseStore::new()), dest);
    migrator.start().await.unwrap();
    assert!(migrator.owned_partitions().is_empty());

    feed.push("late", rec("x", 1)).await;
    assert!(wait_until(WAIT, || async move { dest.get("t1", "x").await.is_some() }).await);
    assert_eq!(migrator.owned_partitions(), vec!["late"]);

    migrator.shutdown().await;
}

// =============================================================================
// SQLite lease store
// =============================================================================

/// Test: Checkpoints and skips survive closing and reopening a SQLite lease store
#[tokio::test]
async fn sqlite_lease_store_persists_progress() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = MigrationConfig::for_testing("a");
    config.lease.sqlite_path = dir.path().join("leases.db").to_string_lossy().into_owned();

    let feed = &MemoryChangeFeed::new();
    let dest = &MemoryDestination::default();
    feed.push("p-0", rec("one", 1)).await;
    feed.push("p-0", rec("bad#id", 1)).await;
    feed.push("p-1", rec("two", 1)).await;
    feed.seal("p-0").await;

    let store = Arc::new(SqliteLeaseStore::open(&config.lease, &config.processor_name).await.unwrap());
    let mut migrator = MigrationEngine::new(
        config.clone(),
        Arc::new(feed.clone()),
        Arc::clone(&store) as Arc<dyn LeaseStore>,
        Arc::new(dest.clone()),
    );
    migrator.start().await.unwrap();
    assert!(wait_for_state(&migrator, "p-0", PartitionState::Ended).await);
    assert!(wait_until(WAIT, || async move { dest.get("t1", "two").await.is_some() }).await);
    migrator.shutdown().await;
    store.close().await;

    let reopened = SqliteLeaseStore::open(&config.lease, &config.processor_name).await.unwrap();
    reopened.initialize().await.unwrap();
    let leases = reopened.read_all().await.unwrap();
    assert_eq!(leases.len(), 2);
    for lease in &leases {
        assert_eq!(lease.owner, None, "{} should have been released", lease.partition_id);
    }
    let p0 = leases.iter().find(|l| l.partition_id == "p-0").unwrap();
    assert_eq!(p0.continuation, Some(ContinuationToken::new("2")));

    let skipped = reopened.skipped().await.unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].record_id, "bad#id");
    reopened.close().await;

    assert_eq!(dest.get("t1", "one").await, Some(json!({"id": "one", "pk": "t1", "v": 1})));
}
