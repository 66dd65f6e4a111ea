//! Fuzz target for routing and fast-path eligibility.
//!
//! Checks that:
//! - routing never panics on any argv
//! - a direct route never also requires approval
//! - nothing with shell metacharacters is fast-path eligible

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shellgate::context::InterceptionContext;
use shellgate::fastpath::FastPathCache;
use shellgate::router::Router;
use shellgate::shell::{arg_has_metacharacters, has_metacharacters};
use std::time::Duration;

#[derive(Debug, Arbitrary)]
struct Invocation {
    command: String,
    args: Vec<String>,
    is_sudo: bool,
}

fuzz_target!(|input: Invocation| {
    if input.args.len() > 64 || input.args.iter().map(String::len).sum::<usize>() > 10_000 {
        return;
    }

    let ctx = InterceptionContext::builder(input.command.clone(), input.args.clone())
        .env(Default::default())
        .cwd("/tmp")
        .sudo(input.is_sudo)
        .parent_pid(None)
        .build();
    let decision = Router::default().route(&input.command, &input.args, &ctx);
    assert!(!(decision.direct && decision.requires_approval));

    let meta = has_metacharacters(&input.args) || arg_has_metacharacters(&input.command);
    if meta {
        assert!(!decision.direct, "direct route with metacharacters: {input:?}");
    }

    let cache = FastPathCache::new(Duration::from_secs(60), 16);
    if cache.is_eligible(&input.command, &input.args) {
        assert!(!meta, "fast path accepted metacharacters: {input:?}");
    }
});
