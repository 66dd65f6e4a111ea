//! Fuzz target for remote analysis response parsing.
//!
//! Malformed bodies must come back as errors, never panics, and anything
//! accepted must carry a confidence in `[0, 1]`.

#![no_main]

use libfuzzer_sys::fuzz_target;
use shellgate::analysis::http::parse_response;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = std::str::from_utf8(data) else {
        return;
    };
    if body.len() > 100_000 {
        return;
    }

    if let Ok(analysis) = parse_response(body) {
        assert!((0.0..=1.0).contains(&analysis.confidence));
        let _ = serde_json::to_string(&analysis);
    }
});
