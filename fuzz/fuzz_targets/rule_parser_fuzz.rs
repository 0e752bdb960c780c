//! Fuzz target for the projection rule parser.
//!
//! Any UTF-8 input must parse or fail without panicking. A rule that parses
//! must render to text that parses back to the same rule, and must never
//! translate a federated path to somewhere outside its source root.
//!
//! Run with: cargo +nightly fuzz run rule_parser_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use weave_core::Path;
use weave_federation::ProjectionParser;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let parser = ProjectionParser::new();
    let Ok(rule) = parser.parse(input) else {
        return;
    };

    let rendered = rule.to_string();
    let again = parser.parse(&rendered);
    assert_eq!(again.as_ref(), Ok(&rule), "rendered rule {:?} did not parse back", rendered);

    for probe in ["/", "/a", "/a/b", "/a/../..", "/x/./y"] {
        let Ok(federated) = Path::parse(probe) else {
            continue;
        };
        let federated = rule.federated_root().join(federated.segments());
        if let Some(source) = rule.translate_to_source(&federated) {
            assert!(rule.source_root().is_at_or_above(&source));
            assert!(source.is_normalized());
        }
    }
});
