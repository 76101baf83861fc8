//! Fuzz target for partition lag estimation.
//!
//! Checkpoint tokens are read back from the lease store and may be anything.

#![no_main]

use changefeed_migrator::feed::{calculate_lag_ms, parse_stream_id_timestamp};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (checkpoint, latest) = data;

    let cursor_ts = parse_stream_id_timestamp(checkpoint);
    let latest_ts = parse_stream_id_timestamp(latest);
    let lag = calculate_lag_ms(checkpoint, latest);

    match (cursor_ts, latest_ts) {
        (Some(c), Some(l)) => assert_eq!(lag, Some(l.saturating_sub(c))),
        _ => assert_eq!(lag, None),
    }
});
