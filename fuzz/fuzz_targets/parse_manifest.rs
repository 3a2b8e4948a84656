#![no_main]

use ktl_manifest::{NormalizeOptions, parse_manifest};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(source) = std::str::from_utf8(data) {
        // Parsing must never panic; malformed documents are dropped or
        // surfaced as errors.
        let _ = parse_manifest(source, &NormalizeOptions::default());
    }
});
