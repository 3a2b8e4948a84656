#![no_main]

use ktl_stack::types::RunEvent;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary event-log lines either fail to parse or round-trip to an
    // equivalent line.
    if let Ok(line) = std::str::from_utf8(data) {
        if let Ok(event) = serde_json::from_str::<RunEvent>(line) {
            let encoded = serde_json::to_string(&event).expect("serialize");
            let back: RunEvent = serde_json::from_str(&encoded).expect("reparse");
            assert_eq!(back, event);
        }
    }
});
