//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use changefeed_migrator::batch::coalesce;
use changefeed_migrator::destination::{prepare_record, WriteError, MAX_ID_BYTES};
use changefeed_migrator::feed::{compare_stream_ids, maybe_decompress, parse_stream_id_timestamp};
use changefeed_migrator::lease::{evaluate, ContinuationToken, Lease, LeaseRequest};
use changefeed_migrator::{
    BatchApplier, ChangeBatch, ChangeRecord, CircuitBreaker, CircuitConfig, MemoryDestination, ReplayConfig,
};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const NOW: i64 = 1_700_000_000_000;
const LEASE: Duration = Duration::from_secs(60);

// =============================================================================
// Lease Compare-And-Swap Properties
// =============================================================================

/// Run requests one after another against a single stored record, the way a
/// store serializes them. Returns how many were granted.
fn run_cas(mut current: Option<Lease>, requests: &[LeaseRequest], now: i64) -> (usize, Option<Lease>) {
    let mut granted = 0;
    for request in requests {
        if let Some(next) = evaluate(current.as_ref(), request, now) {
            granted += 1;
            current = Some(next);
        }
    }
    (granted, current)
}

fn owner_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(String::from)
}

proptest! {
    /// Competing creates for a new partition: exactly one wins
    #[test]
    fn cas_create_has_one_winner(owners in prop::collection::vec(owner_strategy(), 1..8)) {
        let requests: Vec<_> = owners.iter().map(|o| LeaseRequest::create("p-0", o.as_str(), LEASE)).collect();
        let (granted, stored) = run_cas(None, &requests, NOW);

        prop_assert_eq!(granted, 1);
        let stored = stored.unwrap();
        prop_assert_eq!(stored.owner.as_deref(), Some(owners[0].as_str()));
        prop_assert_eq!(stored.version, 1);
    }

    /// Claims made from the same observed version: at most one wins
    #[test]
    fn cas_claims_from_same_snapshot_have_at_most_one_winner(
        holder in prop::option::of(owner_strategy()),
        expires_offset_ms in -120_000i64..120_000,
        version in 1u64..1000,
        claimants in prop::collection::vec(owner_strategy(), 1..8),
    ) {
        let observed = Lease {
            partition_id: "p-0".to_string(),
            owner: holder,
            continuation: Some(ContinuationToken::new("42")),
            expires_at_ms: NOW + expires_offset_ms,
            version,
        };
        let requests: Vec<_> = claimants.iter().map(|o| LeaseRequest::claim(&observed, o.as_str(), LEASE)).collect();
        let (granted, stored) = run_cas(Some(observed.clone()), &requests, NOW);

        prop_assert!(granted <= 1, "{} claims granted", granted);
        let stored = stored.unwrap();
        if granted == 1 {
            prop_assert_eq!(stored.version, version + 1);
            // A claim without a token keeps the stored checkpoint.
            prop_assert_eq!(stored.continuation, observed.continuation);
        } else {
            prop_assert_eq!(stored, observed);
        }
    }

    /// A live lease is only ever granted back to its holder
    #[test]
    fn cas_live_lease_is_exclusive(
        holder in owner_strategy(),
        claimant in owner_strategy(),
        remaining_ms in 1i64..120_000,
    ) {
        let live = Lease {
            partition_id: "p-0".to_string(),
            owner: Some(holder.clone()),
            continuation: None,
            expires_at_ms: NOW + remaining_ms,
            version: 3,
        };
        let granted = evaluate(Some(&live), &LeaseRequest::claim(&live, claimant.as_str(), LEASE), NOW);
        prop_assert_eq!(granted.is_some(), claimant == holder);
    }

    /// Versions strictly increase across any sequence of granted mutations
    #[test]
    fn cas_versions_increase(owners in prop::collection::vec(owner_strategy(), 1..20), tokens in 0usize..20) {
        let mut current = evaluate(None, &LeaseRequest::create("p-0", "a", LEASE), NOW);
        let mut now = NOW;
        for (i, owner) in owners.iter().enumerate() {
            // Step past expiry so every claim is allowed.
            now += 61_000;
            let lease = current.clone().unwrap();
            let mut request = LeaseRequest::claim(&lease, owner.as_str(), LEASE);
            if i < tokens {
                request = request.with_continuation(ContinuationToken::new(i.to_string()));
            }
            let next = evaluate(Some(&lease), &request, now).unwrap();
            prop_assert_eq!(next.version, lease.version + 1);
            current = Some(next);
        }
    }
}

// =============================================================================
// Coalescing And Redelivery Properties
// =============================================================================

fn record_strategy() -> impl Strategy<Value = ChangeRecord> {
    (0u8..6, 0u8..2, 0i64..1000).prop_map(|(id, pk, v)| {
        let id = format!("r{}", id);
        let pk = format!("t{}", pk);
        ChangeRecord::new(id.clone(), pk.clone(), json!({"id": id, "pk": pk, "v": v}))
    })
}

/// The destination state a perfect last-writer-wins replay would produce.
fn expected_state(batches: &[Vec<ChangeRecord>]) -> BTreeMap<(String, String), serde_json::Value> {
    let mut state = BTreeMap::new();
    for record in batches.iter().flatten() {
        state.insert((record.partition_key.clone(), record.id.clone()), record.payload.clone());
    }
    state
}

proptest! {
    /// Coalescing keeps exactly the latest snapshot per key, in first-seen order
    #[test]
    fn coalesce_keeps_latest_per_key(records in prop::collection::vec(record_strategy(), 0..40)) {
        let (writes, dropped) = coalesce(&records);

        prop_assert_eq!(writes.len() + dropped, records.len());
        for pair in writes.windows(2) {
            prop_assert!(pair[0].position < pair[1].position);
        }
        for write in &writes {
            let key = (&write.record.partition_key, &write.record.id);
            let latest = records.iter().rev().find(|r| (&r.partition_key, &r.id) == key).unwrap();
            prop_assert_eq!(&write.record, latest);
            let first = records.iter().position(|r| (&r.partition_key, &r.id) == key).unwrap();
            prop_assert_eq!(write.position, first);
        }
    }

    /// Replaying any prefix of batches again never changes the final destination state
    #[test]
    fn redelivery_converges_to_latest_snapshots(
        batches in prop::collection::vec(prop::collection::vec(record_strategy(), 1..8), 1..6),
        replays in prop::collection::vec(any::<bool>(), 6),
        coalesce_by_id in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let final_state = runtime.block_on(async {
            let dest = MemoryDestination::default();
            let replay = ReplayConfig { coalesce_by_id, ..ReplayConfig::for_testing() };
            let applier = BatchApplier::new(
                Arc::new(dest.clone()),
                Arc::new(CircuitBreaker::new("prop", CircuitConfig::lenient())),
                None,
                &replay,
            );

            for (i, records) in batches.iter().enumerate() {
                let batch = ChangeBatch {
                    records: records.clone(),
                    malformed: Vec::new(),
                    next_token: ContinuationToken::new(i.to_string()),
                };
                applier.apply("p-0", &batch).await.unwrap();
                // A lost checkpoint means the same batch is read and applied again.
                if replays[i] {
                    applier.apply("p-0", &batch).await.unwrap();
                }
            }
            dest.snapshot().await
        });

        prop_assert_eq!(final_state, expected_state(&batches));
    }
}

// =============================================================================
// Destination Id Validation Properties
// =============================================================================

proptest! {
    /// Ids made of ordinary characters within the length limit are accepted
    #[test]
    fn valid_ids_are_accepted(id in "[a-zA-Z0-9_.:-]{1,64}") {
        let record = ChangeRecord::new(id.clone(), "t1", json!({"id": id}));
        prop_assert!(prepare_record(&record, 1024 * 1024).is_ok());
    }

    /// Any id containing a reserved character is rejected permanently
    #[test]
    fn reserved_characters_are_fatal(
        prefix in "[a-z0-9]{0,16}",
        reserved in prop::sample::select(vec!['/', '\\', '?', '#']),
        suffix in "[a-z0-9]{0,16}",
    ) {
        let id = format!("{}{}{}", prefix, reserved, suffix);
        let record = ChangeRecord::new(id, "t1", json!({}));
        prop_assert!(matches!(prepare_record(&record, 1024), Err(WriteError::Fatal(_))));
    }

    /// Overlong ids are rejected permanently
    #[test]
    fn overlong_ids_are_fatal(extra in 1usize..100) {
        let record = ChangeRecord::new("x".repeat(MAX_ID_BYTES + extra), "t1", json!({}));
        prop_assert!(matches!(prepare_record(&record, 1024), Err(WriteError::Fatal(_))));
    }
}

// =============================================================================
// Stream ID Properties
// =============================================================================

proptest! {
    /// Stream ID comparison is antisymmetric: if a < b then b > a
    #[test]
    fn stream_id_comparison_antisymmetric(
        ts1 in 0u64..1_000_000_000_000u64,
        seq1 in 0u64..1000u64,
        ts2 in 0u64..1_000_000_000_000u64,
        seq2 in 0u64..1000u64,
    ) {
        let id1 = format!("{}-{}", ts1, seq1);
        let id2 = format!("{}-{}", ts2, seq2);
        prop_assert_eq!(compare_stream_ids(&id1, &id2).reverse(), compare_stream_ids(&id2, &id1));
    }

    /// Comparison agrees with numeric (timestamp, sequence) ordering
    #[test]
    fn stream_id_ordering_is_numeric(
        ts1 in 0u64..1_000_000_000_000u64,
        seq1 in 0u64..1000u64,
        ts2 in 0u64..1_000_000_000_000u64,
        seq2 in 0u64..1000u64,
    ) {
        let id1 = format!("{}-{}", ts1, seq1);
        let id2 = format!("{}-{}", ts2, seq2);
        prop_assert_eq!(compare_stream_ids(&id1, &id2), (ts1, seq1).cmp(&(ts2, seq2)));
    }

    /// Timestamp parsing recovers the millisecond part
    #[test]
    fn stream_id_timestamp_parsing(ts in 0u64..u64::MAX, seq in 0u64..1000u64) {
        let id = format!("{}-{}", ts, seq);
        prop_assert_eq!(parse_stream_id_timestamp(&id), Some(ts));
    }
}

// =============================================================================
// Payload Decompression Properties
// =============================================================================

proptest! {
    /// Data without the zstd magic passes through unchanged
    #[test]
    fn decompress_passthrough_non_zstd(data in prop::collection::vec(any::<u8>(), 0..1000)) {
        let mut safe = data;
        if safe.len() >= 4 && safe[..4] == [0x28, 0xB5, 0x2F, 0xFD] {
            safe[0] = 0x00;
        }
        prop_assert_eq!(maybe_decompress(&safe).unwrap(), safe);
    }

    /// Compressed payloads decode back to the original bytes
    #[test]
    fn decompress_zstd_roundtrip(data in prop::collection::vec(any::<u8>(), 1..10000)) {
        let compressed = zstd::encode_all(data.as_slice(), 3).unwrap();
        prop_assert_eq!(maybe_decompress(&compressed).unwrap(), data);
    }
}
