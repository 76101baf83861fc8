//! Fuzz target for change stream entry parsing.
//!
//! Arbitrary field maps must parse or fail cleanly. A parsed upsert always
//! carries a JSON object payload.

#![no_main]

use changefeed_migrator::feed::{parse_entry, SourceEntry};
use libfuzzer_sys::fuzz_target;
use redis::Value;
use std::collections::HashMap;

fuzz_target!(|data: (Vec<(String, Vec<u8>)>, &str)| {
    let (pairs, key_path) = data;
    let fields: HashMap<String, Value> = pairs
        .into_iter()
        .map(|(k, v)| (k, Value::BulkString(v)))
        .collect();

    if let Ok(SourceEntry::Upsert(record)) = parse_entry(&fields, key_path) {
        assert!(record.payload.is_object());
    }
});
