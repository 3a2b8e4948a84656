#![no_main]

use ktl_stack::plan::CURRENT_PLAN_VERSION;
use ktl_stack::store::validate_schema_version;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(version) = std::str::from_utf8(data) {
        // Validation never panics, whatever the tag looks like.
        let _ = validate_schema_version(version, CURRENT_PLAN_VERSION);
    }
});
