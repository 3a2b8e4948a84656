#![no_main]

use ktl_manifest::{NormalizeOptions, summarize};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (previous, proposed) = data;
    let opts = NormalizeOptions::default();
    if let Ok(summary) = summarize(previous, proposed, &opts) {
        // Counts always agree with the change lists.
        assert_eq!(
            summary.add + summary.change + summary.replace + summary.destroy,
            summary.changes.len()
        );
        assert_eq!(
            summary.hooks.add + summary.hooks.change + summary.hooks.replace
                + summary.hooks.destroy,
            summary.hooks.changes.len()
        );
    }
});
