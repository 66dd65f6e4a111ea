//! Fuzz target for the redaction engine.
//!
//! Redaction must never panic, must leave text with no matches untouched, and
//! must be idempotent on its own output.

#![no_main]

use libfuzzer_sys::fuzz_target;
use shellgate::redact::{RedactOptions, Redactor};
use std::sync::LazyLock;

static REDACTOR: LazyLock<Redactor> = LazyLock::new(|| Redactor::with_capacity(0));

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if text.len() > 10_000 {
        return;
    }

    let options = RedactOptions {
        mask: false,
        redact_emails: data.first().is_some_and(|b| b & 1 == 1),
    };
    let once = REDACTOR.redact(text, &options);
    assert!(once.redacted.len() <= text.len() + once.matches.len() * 32);

    // Nothing matched: the text comes back untouched.
    if once.matches.is_empty() {
        assert_eq!(once.redacted, text);
    }

    let twice = REDACTOR.redact(&once.redacted, &options);
    assert_eq!(twice.redacted, once.redacted, "redaction not idempotent for {text:?}");
});
