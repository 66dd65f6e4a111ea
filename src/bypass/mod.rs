//! Bypass detection.
//!
//! Each check looks at one independent signal: what stdin is attached to,
//! who our ancestors are, what the environment carries, how it drifted from
//! the baseline, and how young the parent is. Checks run concurrently on
//! scoped threads. Only the single highest-confidence positive signal is
//! reported; signals are never summed or averaged. A check that panics
//! contributes nothing.

pub mod process_tree;
pub mod stdin;

pub use process_tree::{ProcessInfo, ProcessTreeProvider, ancestors, platform_tree};
pub use stdin::{FdStdinProbe, FixedStdin, StdinKind, StdinProbe};

use crate::config::BypassConfig;
use crate::context::InterceptionContext;
use aho_corasick::AhoCorasick;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use std::time::Duration;

/// Gate-control variables that claim to switch the gate off.
pub const BYPASS_FLAGS: &[&str] = &[
    "SHELLGATE_BYPASS",
    "SHELLGATE_SKIP",
    "SHELLGATE_DISABLE",
    "SHELLGATE_TRUSTED",
    "SHELLGATE_APPROVED",
];

/// Dynamic-loader variables that inject code into every child.
pub const LIBRARY_INJECTION: &[&str] = &[
    "LD_PRELOAD",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_FORCE_FLAT_NAMESPACE",
];

/// Programs that drive terminals on behalf of a script.
const AUTOMATION_TOOLS: &[&str] = &[
    "expect",
    "autoexpect",
    "xdotool",
    "ydotool",
    "empty",
    "pexpect",
    "sikuli",
    "autohotkey",
];

/// Tools recognizable from a library or jar name anywhere on the command line.
const AUTOMATION_LIBRARIES: &[&str] = &["pexpect", "sikuli"];

static LIBRARY_MATCHER: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::new(AUTOMATION_LIBRARIES).expect("automation library names should be valid patterns")
});

/// Programs that fabricate a terminal around a non-interactive caller.
const PTY_WRAPPERS: &[&str] = &["script", "unbuffer", "socat", "ttyd", "dtach", "abduco"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassMethod {
    Pipe,
    Automation,
    ProcessAncestry,
    Environment,
    EnvironmentDrift,
    Descriptor,
    Timing,
    None,
}

impl BypassMethod {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pipe => "pipe",
            Self::Automation => "automation",
            Self::ProcessAncestry => "process_ancestry",
            Self::Environment => "environment",
            Self::EnvironmentDrift => "environment_drift",
            Self::Descriptor => "descriptor",
            Self::Timing => "timing",
            Self::None => "none",
        }
    }
}

impl fmt::Display for BypassMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BypassSignal {
    pub detected: bool,
    pub method: BypassMethod,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub details: String,
    pub severity: Severity,
}

impl BypassSignal {
    /// The negative signal.
    #[must_use]
    pub fn none() -> Self {
        Self {
            detected: false,
            method: BypassMethod::None,
            confidence: 0.0,
            details: String::new(),
            severity: Severity::Low,
        }
    }

    #[must_use]
    pub fn positive(
        method: BypassMethod,
        confidence: f64,
        severity: Severity,
        details: impl Into<String>,
    ) -> Self {
        Self {
            detected: true,
            method,
            confidence: confidence.clamp(0.0, 1.0),
            details: details.into(),
            severity,
        }
    }
}

/// The highest-confidence positive signal, or [`BypassSignal::none`].
#[must_use]
pub fn strongest(signals: impl IntoIterator<Item = BypassSignal>) -> BypassSignal {
    signals
        .into_iter()
        .filter(|s| s.detected)
        .fold(None::<BypassSignal>, |best, s| match best {
            Some(b) if b.confidence >= s.confidence => Some(b),
            _ => Some(s),
        })
        .unwrap_or_else(BypassSignal::none)
}

type Check<'a> = Box<dyn Fn() -> Option<BypassSignal> + Send + Sync + 'a>;

/// Runs every check and keeps the strongest signal.
pub struct BypassDetector {
    tree: Arc<dyn ProcessTreeProvider>,
    stdin: Arc<dyn StdinProbe>,
    baseline: RwLock<BTreeMap<String, String>>,
    max_depth: usize,
    parent_uptime_floor: Duration,
}

impl fmt::Debug for BypassDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BypassDetector")
            .field("max_depth", &self.max_depth)
            .field("parent_uptime_floor", &self.parent_uptime_floor)
            .finish_non_exhaustive()
    }
}

impl BypassDetector {
    /// Detector over explicit capabilities. The baseline starts as the
    /// security-relevant subset of `baseline_env`.
    #[must_use]
    pub fn new(
        tree: Arc<dyn ProcessTreeProvider>,
        stdin: Arc<dyn StdinProbe>,
        baseline_env: &BTreeMap<String, String>,
        config: &BypassConfig,
    ) -> Self {
        Self {
            tree,
            stdin,
            baseline: RwLock::new(security_subset(baseline_env)),
            max_depth: config.max_depth,
            parent_uptime_floor: Duration::from_millis(config.parent_uptime_floor_ms),
        }
    }

    /// Detector for this process, baselined on its current environment.
    #[must_use]
    pub fn for_current_process(config: &BypassConfig) -> Self {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        Self::new(platform_tree(), Arc::new(FdStdinProbe), &env, config)
    }

    /// Replace the baseline with the security-relevant subset of `env`.
    pub fn refresh_baseline(&self, env: &BTreeMap<String, String>) {
        let fresh = security_subset(env);
        *self.baseline.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    /// Run every check against `ctx`.
    #[must_use]
    pub fn detect(&self, ctx: &InterceptionContext) -> BypassSignal {
        let checks: Vec<Check<'_>> = vec![
            Box::new(|| self.check_stdin()),
            Box::new(|| self.check_ancestry(ctx)),
            Box::new(|| check_environment(&ctx.env)),
            Box::new(|| self.check_drift(&ctx.env)),
            Box::new(|| self.check_timing(ctx)),
        ];

        let signals: Vec<BypassSignal> = std::thread::scope(|scope| {
            let handles: Vec<_> = checks
                .iter()
                .map(|check| scope.spawn(move || check()))
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| match handle.join() {
                    Ok(signal) => signal,
                    Err(_) => {
                        tracing::error!("bypass check panicked; ignoring its result");
                        None
                    }
                })
                .collect()
        });

        strongest(signals)
    }

    fn check_stdin(&self) -> Option<BypassSignal> {
        match self.stdin.kind() {
            StdinKind::Pipe => Some(BypassSignal::positive(
                BypassMethod::Pipe,
                0.95,
                Severity::High,
                "stdin is a pipe",
            )),
            StdinKind::File => Some(BypassSignal::positive(
                BypassMethod::Pipe,
                0.95,
                Severity::High,
                "stdin is redirected from a file",
            )),
            StdinKind::Socket => Some(BypassSignal::positive(
                BypassMethod::Pipe,
                0.95,
                Severity::High,
                "stdin is a socket",
            )),
            StdinKind::PtyMaster => Some(BypassSignal::positive(
                BypassMethod::Descriptor,
                0.8,
                Severity::High,
                "stdin is a pseudo-terminal master",
            )),
            StdinKind::NullDevice => Some(BypassSignal::positive(
                BypassMethod::Descriptor,
                0.7,
                Severity::High,
                "stdin is /dev/null",
            )),
            StdinKind::Closed => Some(BypassSignal::positive(
                BypassMethod::Descriptor,
                0.7,
                Severity::High,
                "stdin is closed",
            )),
            StdinKind::Terminal | StdinKind::Other => None,
        }
    }

    fn check_ancestry(&self, ctx: &InterceptionContext) -> Option<BypassSignal> {
        let start = ctx.parent_pid?;
        let chain = ancestors(self.tree.as_ref(), start, self.max_depth);
        strongest(chain.iter().filter_map(classify_ancestor)).detected_or_none()
    }

    fn check_drift(&self, env: &BTreeMap<String, String>) -> Option<BypassSignal> {
        let current = security_subset(env);
        let baseline = self.baseline.read().unwrap_or_else(PoisonError::into_inner);
        let mut drifted: Vec<&str> = baseline
            .keys()
            .chain(current.keys())
            .filter(|key| baseline.get(*key) != current.get(*key))
            .map(String::as_str)
            .collect();
        drifted.sort_unstable();
        drifted.dedup();
        if drifted.is_empty() {
            return None;
        }
        Some(BypassSignal::positive(
            BypassMethod::EnvironmentDrift,
            0.75,
            Severity::High,
            format!("changed since baseline: {}", drifted.join(", ")),
        ))
    }

    fn check_timing(&self, ctx: &InterceptionContext) -> Option<BypassSignal> {
        let parent = self.tree.process(ctx.parent_pid?)?;
        let age = parent.age?;
        (age < self.parent_uptime_floor).then(|| {
            BypassSignal::positive(
                BypassMethod::Timing,
                0.5,
                Severity::Medium,
                format!(
                    "parent '{}' started {}ms ago",
                    parent.name,
                    age.as_millis()
                ),
            )
        })
    }
}

impl BypassSignal {
    fn detected_or_none(self) -> Option<Self> {
        self.detected.then_some(self)
    }
}

/// Match one ancestor against the automation and pty-wrapper tables.
fn classify_ancestor(process: &ProcessInfo) -> Option<BypassSignal> {
    let argv0 = process
        .cmdline
        .first()
        .map(|a| crate::shell::base_name(a))
        .unwrap_or_default();
    let is_named = |name: &str| process.name == name || argv0 == name;

    if let Some(tool) = AUTOMATION_TOOLS.iter().find(|t| is_named(t)).or_else(|| {
        process
            .cmdline
            .iter()
            .find_map(|arg| LIBRARY_MATCHER.find(arg.as_str()))
            .map(|m| &AUTOMATION_LIBRARIES[m.pattern().as_usize()])
    }) {
        return Some(BypassSignal::positive(
            BypassMethod::Automation,
            0.9,
            Severity::Critical,
            format!("ancestor {} is automation tool '{tool}'", process.pid),
        ));
    }

    let screen_driven = is_named("screen") && process.cmdline.iter().any(|a| a == "-X");
    if let Some(wrapper) = PTY_WRAPPERS
        .iter()
        .find(|w| is_named(w))
        .copied()
        .or(screen_driven.then_some("screen -X"))
    {
        return Some(BypassSignal::positive(
            BypassMethod::ProcessAncestry,
            0.7,
            Severity::High,
            format!("ancestor {} is pty wrapper '{wrapper}'", process.pid),
        ));
    }
    None
}

/// Deny-listed variables present in `env`.
fn check_environment(env: &BTreeMap<String, String>) -> Option<BypassSignal> {
    let flags: Vec<&str> = BYPASS_FLAGS
        .iter()
        .copied()
        .filter(|k| env.contains_key(*k))
        .collect();
    if !flags.is_empty() {
        return Some(BypassSignal::positive(
            BypassMethod::Environment,
            0.99,
            Severity::Critical,
            format!("gate-control variable set: {}", flags.join(", ")),
        ));
    }
    let injected: Vec<&str> = LIBRARY_INJECTION
        .iter()
        .copied()
        .filter(|k| env.get(*k).is_some_and(|v| !v.trim().is_empty()))
        .collect();
    if !injected.is_empty() {
        return Some(BypassSignal::positive(
            BypassMethod::Environment,
            0.95,
            Severity::Critical,
            format!("library injection variable set: {}", injected.join(", ")),
        ));
    }
    None
}

/// `PATH` plus every `LD_*` and `DYLD_*` variable.
fn security_subset(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(k, _)| *k == "PATH" || k.starts_with("LD_") || k.starts_with("DYLD_"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
