// Deny unsafe code everywhere except the libc wrappers in `sys`.
#![deny(unsafe_code)]
//! shellgate library.
//!
//! Intercepts shell command invocations and decides, fail-closed, whether each
//! one runs, is refused, or needs a human to confirm it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Configuration                            │
//! │  (env vars → project config → user config → system → defaults)  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Interceptor                            │
//! │  route → bypass check → fast path → verdict → approve/issue     │
//! └─────────────────────────────────────────────────────────────────┘
//!          │                 │                 │                │
//!          ▼                 ▼                 ▼                ▼
//!   ┌────────────┐   ┌──────────────┐  ┌──────────────┐  ┌────────────┐
//!   │   Router   │   │    Bypass    │  │   Analysis   │  │  /dev/tty  │
//!   │  Fast path │   │   Detector   │  │ remote+local │  │  approval  │
//!   └────────────┘   └──────────────┘  └──────────────┘  └────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │           sign → verify → spawn with sanitized environment      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every string headed for a log, a prompt, or the remote classifier passes
//! through the [`redact`] engine first.
//!
//! # Usage
//!
//! ```ignore
//! use shellgate::config::Config;
//! use shellgate::context::InterceptionContext;
//! use shellgate::orchestrator::Interceptor;
//!
//! let interceptor = Interceptor::builder(Config::load()?).build()?;
//! let ctx = InterceptionContext::capture("git", vec!["push".into(), "--force".into()])?;
//! let report = interceptor.intercept(ctx).await;
//! std::process::exit(report.outcome.exit_code());
//! ```

pub mod analysis;
pub mod auth_codes;
pub mod builtins;
pub mod bypass;
pub mod cli;
pub mod config;
pub mod context;
pub mod error_codes;
pub mod evaluator;
pub mod exec;
pub mod fastpath;
pub mod integrity;
pub mod interactive;
pub mod logging;
pub mod orchestrator;
pub mod output;
pub mod redact;
pub mod router;
pub mod shell;
pub mod sys;
pub mod terminal;

pub use config::Config;
pub use context::InterceptionContext;
pub use error_codes::{ErrorCategory, ErrorCode, GateError};
pub use orchestrator::{InterceptionOutcome, InterceptionReport, Interceptor, InterceptorBuilder};
pub use redact::Redactor;
pub use router::{RouteTag, Router, RoutingDecision};
