//! Fuzz target for continuation token ordering.
//!
//! Stream ids must compare as a total order even when malformed, otherwise
//! trimmed-checkpoint detection could flip-flop.

#![no_main]

use changefeed_migrator::feed::compare_stream_ids;
use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str, &str)| {
    let (a, b, c) = data;

    let ab = compare_stream_ids(a, b);
    assert_eq!(ab.reverse(), compare_stream_ids(b, a));
    assert_eq!(compare_stream_ids(a, a), Ordering::Equal);

    if ab != Ordering::Greater && compare_stream_ids(b, c) != Ordering::Greater {
        assert_ne!(compare_stream_ids(a, c), Ordering::Greater);
    }
});
