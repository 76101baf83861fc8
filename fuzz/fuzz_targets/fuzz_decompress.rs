//! Fuzz target for payload decompression.
//!
//! Change stream payloads come straight off the wire; `maybe_decompress`
//! must return an error, never panic.

#![no_main]

use changefeed_migrator::feed::maybe_decompress;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(out) = maybe_decompress(data) {
        // Anything without the zstd magic passes through untouched.
        if data.len() < 4 || data[..4] != [0x28, 0xB5, 0x2F, 0xFD] {
            assert_eq!(out, data);
        }
    }
});
