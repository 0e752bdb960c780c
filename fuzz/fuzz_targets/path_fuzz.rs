//! Fuzz target for path parsing and normalization.
//!
//! Run with: cargo +nightly fuzz run path_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use weave_core::Path;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(path) = Path::parse(input) else {
        return;
    };

    // Display output parses back to the same path.
    assert_eq!(Path::parse(&path.to_string()), Ok(path.clone()));

    if let Some(normalized) = path.normalized() {
        assert!(normalized.is_normalized());
        assert!(normalized.len() <= path.len());
        assert_eq!(normalized.normalized(), Some(normalized.clone()));
    }
});
