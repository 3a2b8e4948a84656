#![no_main]

use std::time::Duration;

use ktl_retry::BackoffConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, u64, u64, f64, u8)| {
    let (attempt, base_ms, max_ms, multiplier, jitter_byte) = data;
    let attempt = attempt % 1000 + 1;
    let config = BackoffConfig {
        base_delay: Duration::from_millis(base_ms % 60_000),
        max_delay: Duration::from_millis(max_ms % 600_000 + 1),
        multiplier: if multiplier.is_finite() { multiplier.abs() % 8.0 } else { 2.0 },
        jitter: f64::from(jitter_byte) / 255.0,
    };

    let raw = config.raw_delay_for_attempt(attempt);
    assert!(raw <= config.max_delay);

    let widened = config.widened();
    assert!(widened.base_delay >= config.base_delay);
    let _ = config.delay_for_attempt(attempt);
});
