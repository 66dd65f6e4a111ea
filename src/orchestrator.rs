//! Interception orchestrator.
//!
//! Every invocation ends in exactly one [`InterceptionOutcome`]. The pipeline:
//!
//! 1. route; builtins go straight to the builtin handler
//! 2. log the redacted command line
//! 3. bypass detection, aborting above the configured threshold
//! 4. direct execution when the route is safe and the fast path agrees
//! 5. verdict acquisition (remote analysis, local fallback)
//! 6. ALLOW executes, BLOCK denies, WARN asks on the terminal or mints an
//!    auth code
//! 7. sign and verify immediately before spawning
//!
//! The pipeline runs in its own task; a panic anywhere in it is a denial.

use crate::analysis::{Analysis, AnalysisBackend, Verdict};
use crate::auth_codes::{AuthCodeIssuer, AuthCodeStore, AuthGrant};
use crate::builtins;
use crate::bypass::{BypassDetector, BypassSignal};
use crate::config::Config;
use crate::context::InterceptionContext;
use crate::error_codes::GateError;
use crate::evaluator::VerdictEvaluator;
use crate::exec::{ExecRequest, Executor, ProcessExecutor};
use crate::fastpath::FastPathCache;
use crate::integrity::{IdentityProbe, IntegritySigner, ProcessIdentity, SignedCommand};
use crate::interactive::{ApprovalChannel, ApprovalRequest, ApprovalResult};
use crate::redact::Redactor;
use crate::router::{RouteTag, Router, RoutingDecision};
use crate::terminal::{DevTtyProvider, TerminalProvider};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Exit status for a blocked command.
pub const EXIT_BLOCKED: i32 = 3;
/// Exit status for a denied command.
pub const EXIT_DENIED: i32 = 2;
/// Exit status when execution was attempted but failed.
pub const EXIT_ERRORED: i32 = 4;

/// Terminal state of one interception. Only `Executed` ever ran a child.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InterceptionOutcome {
    Executed {
        exit_code: i32,
    },
    /// Refused for a security reason before any verdict was consulted.
    Blocked {
        reason: String,
        signal: Option<BypassSignal>,
    },
    Denied {
        reason: String,
        auth_code: Option<String>,
    },
    /// Execution was approved but could not start.
    Errored {
        reason: String,
    },
}

impl InterceptionOutcome {
    fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
            auth_code: None,
        }
    }

    fn blocked(reason: impl Into<String>) -> Self {
        Self::Blocked {
            reason: reason.into(),
            signal: None,
        }
    }

    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Executed { exit_code } => *exit_code,
            Self::Blocked { .. } => EXIT_BLOCKED,
            Self::Denied { .. } => EXIT_DENIED,
            Self::Errored { .. } => EXIT_ERRORED,
        }
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Executed { .. } => "executed",
            Self::Blocked { .. } => "blocked",
            Self::Denied { .. } => "denied",
            Self::Errored { .. } => "errored",
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Executed { .. } => None,
            Self::Blocked { reason, .. }
            | Self::Denied { reason, .. }
            | Self::Errored { reason } => Some(reason),
        }
    }
}

/// Outcome plus whatever the pipeline learned on the way.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptionReport {
    pub outcome: InterceptionOutcome,
    /// Redacted command line.
    pub display: String,
    pub route: Option<RoutingDecision>,
    pub bypass: Option<BypassSignal>,
    pub analysis: Option<Analysis>,
    pub approval: Option<ApprovalResult>,
}

impl InterceptionReport {
    fn new(display: String) -> Self {
        Self {
            outcome: InterceptionOutcome::denied("not evaluated"),
            display,
            route: None,
            bypass: None,
            analysis: None,
            approval: None,
        }
    }

    fn finish(mut self, outcome: InterceptionOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// Sets the flag when dropped, so an abandoned approval stops reading.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// The assembled gate. Cheap to clone; every component is shared.
#[derive(Clone)]
pub struct Interceptor {
    router: Arc<Router>,
    fastpath: Arc<FastPathCache>,
    redactor: Arc<Redactor>,
    bypass: Arc<BypassDetector>,
    bypass_threshold: f64,
    evaluator: VerdictEvaluator,
    approval: Arc<ApprovalChannel>,
    issuer: AuthCodeIssuer,
    signer: Arc<IntegritySigner>,
    executor: Arc<dyn Executor>,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("bypass_threshold", &self.bypass_threshold)
            .field("evaluator", &self.evaluator)
            .field("approval", &self.approval)
            .finish_non_exhaustive()
    }
}

impl Interceptor {
    #[must_use]
    pub fn builder(config: Config) -> InterceptorBuilder {
        InterceptorBuilder::new(config)
    }

    #[must_use]
    pub fn fastpath(&self) -> Arc<FastPathCache> {
        Arc::clone(&self.fastpath)
    }

    #[must_use]
    pub fn issuer(&self) -> &AuthCodeIssuer {
        &self.issuer
    }

    #[must_use]
    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Run the full pipeline for `ctx`.
    pub async fn intercept(&self, ctx: InterceptionContext) -> InterceptionReport {
        let shown = self.redactor.redact_text(&ctx.command_line());
        let this = self.clone();
        match tokio::spawn(async move { this.run(ctx).await }).await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(error = %err, "interception task failed");
                InterceptionReport::new(shown).finish(InterceptionOutcome::denied(format!(
                    "internal failure: {}",
                    GateError::task_failed(&err.to_string())
                )))
            }
        }
    }

    /// Redeem an auth code out of band and run the command it is bound to.
    ///
    /// `ctx` describes the redeeming process; only its environment and user
    /// are used. The code is consumed before the confirmation prompt, so a
    /// refused confirmation burns it.
    pub async fn redeem(&self, code: &str, ctx: InterceptionContext) -> InterceptionReport {
        let code = code.to_string();
        let this = self.clone();
        match tokio::spawn(async move { this.run_redeem(&code, ctx).await }).await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(error = %err, "redemption task failed");
                InterceptionReport::new(String::new())
                    .finish(InterceptionOutcome::denied("internal failure during redemption"))
            }
        }
    }

    async fn run(&self, ctx: InterceptionContext) -> InterceptionReport {
        let route = self.router.route(&ctx.command, &ctx.args, &ctx);
        let shown = self.redactor.redact_text(&ctx.command_line());
        let mut report = InterceptionReport::new(shown.clone());
        report.route = Some(route.clone());

        if route.is_builtin {
            tracing::debug!(command = %shown, "builtin shortcut");
            let outcome = match builtins::prepare(&ctx.command, &ctx.args, &ctx.cwd, &ctx.env) {
                Ok(request) => self.spawn(request).await,
                Err(err) => InterceptionOutcome::denied(err.message),
            };
            return report.finish(outcome);
        }

        tracing::info!(
            command = %shown,
            user = %ctx.user,
            cwd = %self.redactor.redact_text(&ctx.cwd.to_string_lossy()),
            routed = %route.tag,
            "intercepted"
        );

        let signal = match self.detect_bypass(&ctx).await {
            Ok(signal) => signal,
            Err(outcome) => return report.finish(outcome),
        };
        report.bypass = signal.detected.then(|| signal.clone());
        if signal.detected && signal.confidence > self.bypass_threshold {
            crate::security_event!(
                "bypass_detected",
                method = signal.method.as_str(),
                confidence = signal.confidence,
                details = signal.details.as_str(),
                command = shown.as_str()
            );
            let reason = GateError::bypass_detected(
                signal.method.as_str(),
                signal.confidence,
                &signal.details,
            )
            .message;
            return report.finish(InterceptionOutcome::Blocked {
                reason,
                signal: Some(signal),
            });
        }

        if route.direct && self.fastpath.is_eligible(&ctx.command, &ctx.args) {
            tracing::debug!(command = %shown, "direct execution");
            let outcome = self.execute(&ctx, &ctx.command, &ctx.args, &ctx.cwd).await;
            return report.finish(outcome);
        }

        let analysis = self.evaluator.evaluate(&ctx, &route).await;
        report.analysis = Some(analysis.clone());
        tracing::info!(
            command = %shown,
            verdict = %analysis.verdict,
            risk = %analysis.risk_level,
            source = ?analysis.source,
            "verdict"
        );

        match analysis.verdict {
            Verdict::Block => {
                let reason = format!("Blocked: {}", analysis.explanation);
                report.finish(InterceptionOutcome::denied(reason))
            }
            Verdict::Allow => {
                let outcome = self.execute(&ctx, &ctx.command, &ctx.args, &ctx.cwd).await;
                report.finish(outcome)
            }
            Verdict::Warn => self.confirm_or_issue(ctx, route, analysis, report).await,
        }
    }

    async fn confirm_or_issue(
        &self,
        ctx: InterceptionContext,
        route: RoutingDecision,
        analysis: Analysis,
        mut report: InterceptionReport,
    ) -> InterceptionReport {
        if self.approval.terminal_available() {
            let request = ApprovalRequest::new(
                report.display.clone(),
                approval_reason(&route, &analysis),
                Some(analysis),
            );
            let result = self.ask(request).await;
            report.approval = Some(result.clone());
            if result.approved {
                let outcome = self.execute(&ctx, &ctx.command, &ctx.args, &ctx.cwd).await;
                return report.finish(outcome);
            }
            return report.finish(InterceptionOutcome::denied(format!(
                "Not approved: {}",
                result.reason
            )));
        }

        let grant = AuthGrant {
            command: ctx.command.clone(),
            args: ctx.args.clone(),
            cwd: ctx.cwd.clone(),
            display: report.display.clone(),
            analysis: Some(analysis),
        };
        let outcome = match self.issuer.issue(grant) {
            Ok(token) => InterceptionOutcome::Denied {
                reason: "Approval required and no terminal is available".to_string(),
                auth_code: Some(token.code),
            },
            Err(err) => {
                tracing::warn!(error = %err, "could not issue auth code");
                InterceptionOutcome::denied(format!(
                    "Approval required and no terminal is available ({})",
                    err.message
                ))
            }
        };
        report.finish(outcome)
    }

    async fn run_redeem(&self, code: &str, ctx: InterceptionContext) -> InterceptionReport {
        let mut report = InterceptionReport::new(String::new());
        if !self.approval.terminal_available() {
            return report.finish(InterceptionOutcome::denied(
                "Redeeming an auth code requires a controlling terminal",
            ));
        }

        let signal = match self.detect_bypass(&ctx).await {
            Ok(signal) => signal,
            Err(outcome) => return report.finish(outcome),
        };
        if signal.detected && signal.confidence > self.bypass_threshold {
            crate::security_event!(
                "bypass_detected",
                method = signal.method.as_str(),
                confidence = signal.confidence,
                details = signal.details.as_str(),
                command = "redeem"
            );
            report.bypass = Some(signal.clone());
            return report.finish(InterceptionOutcome::Blocked {
                reason: format!("Bypass attempt detected during redemption: {}", signal.details),
                signal: Some(signal),
            });
        }

        let validation = match self.issuer.validate(code) {
            Ok(validation) => validation,
            Err(err) => return report.finish(InterceptionOutcome::denied(err.message)),
        };
        let token = match (validation.data, validation.reason) {
            (Some(token), _) => token,
            (None, reason) => {
                let reason = reason.map_or("unknown", |r| r.as_str());
                return report.finish(InterceptionOutcome::denied(format!(
                    "Auth code rejected: {reason}"
                )));
            }
        };
        report.display.clone_from(&token.display);
        report.analysis.clone_from(&token.analysis);

        let request = ApprovalRequest::new(
            token.display.clone(),
            format!("Redeeming auth code {}", token.code),
            token.analysis.clone(),
        );
        let result = self.ask(request).await;
        report.approval = Some(result.clone());
        if !result.approved {
            return report.finish(InterceptionOutcome::denied(format!(
                "Not approved: {}",
                result.reason
            )));
        }

        let outcome = self
            .execute(&ctx, &token.command, &token.args, &token.cwd)
            .await;
        report.finish(outcome)
    }

    async fn detect_bypass(
        &self,
        ctx: &InterceptionContext,
    ) -> Result<BypassSignal, InterceptionOutcome> {
        let detector = Arc::clone(&self.bypass);
        let snapshot = ctx.clone();
        tokio::task::spawn_blocking(move || detector.detect(&snapshot))
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "bypass detection task failed");
                InterceptionOutcome::denied("bypass detection failed")
            })
    }

    async fn ask(&self, request: ApprovalRequest) -> ApprovalResult {
        let channel = Arc::clone(&self.approval);
        let cancel = Arc::new(AtomicBool::new(false));
        let guard = CancelOnDrop(Arc::clone(&cancel));
        let result =
            tokio::task::spawn_blocking(move || channel.request(&request, &cancel)).await;
        drop(guard);
        match result {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = %err, "approval task failed");
                ApprovalResult {
                    approved: false,
                    reason: "approval failed".to_string(),
                    response_time_ms: 0,
                    suspicious: false,
                    valid_input: false,
                }
            }
        }
    }

    /// Sign the request for `command args` in `cwd` with `ctx`'s environment,
    /// then spawn it once it verifies.
    async fn execute(
        &self,
        ctx: &InterceptionContext,
        command: &str,
        args: &[String],
        cwd: &std::path::Path,
    ) -> InterceptionOutcome {
        let request = ExecRequest::new(command, args.to_vec(), cwd, &ctx.env);
        match self.signer.sign(&request) {
            Ok(signed) => self.spawn_signed(signed, request).await,
            Err(err) => InterceptionOutcome::blocked(err.message),
        }
    }

    /// Verify `request` against `signed` on the spawning thread, immediately
    /// before the executor sees it.
    async fn spawn_signed(&self, signed: SignedCommand, request: ExecRequest) -> InterceptionOutcome {
        let signer = Arc::clone(&self.signer);
        let executor = Arc::clone(&self.executor);
        let program = request.program.clone();
        let task = tokio::task::spawn_blocking(move || {
            if let Some(err) = signer.verify_detailed(&signed, &request).to_error() {
                return Err(InterceptionOutcome::blocked(err.message));
            }
            Ok(executor.execute(&request))
        });
        match task.await {
            Ok(Ok(result)) => exec_outcome(&program, result),
            Ok(Err(rejected)) => rejected,
            Err(err) => {
                tracing::error!(error = %err, "execution task failed");
                InterceptionOutcome::denied("execution task failed")
            }
        }
    }

    async fn spawn(&self, request: ExecRequest) -> InterceptionOutcome {
        let executor = Arc::clone(&self.executor);
        let program = request.program.clone();
        match tokio::task::spawn_blocking(move || executor.execute(&request)).await {
            Ok(result) => exec_outcome(&program, result),
            Err(err) => {
                tracing::error!(error = %err, "execution task failed");
                InterceptionOutcome::denied("execution task failed")
            }
        }
    }
}

fn exec_outcome(program: &str, result: Result<i32, GateError>) -> InterceptionOutcome {
    match result {
        Ok(exit_code) => InterceptionOutcome::Executed { exit_code },
        Err(err) => {
            tracing::warn!(program = %program, error = %err, "execution failed");
            InterceptionOutcome::Errored {
                reason: err.message,
            }
        }
    }
}

fn approval_reason(route: &RoutingDecision, analysis: &Analysis) -> String {
    match route.tag {
        RouteTag::Unknown => analysis.explanation.clone(),
        _ => format!("{} ({})", analysis.explanation, route.reason),
    }
}

enum BackendChoice {
    FromConfig,
    Fixed(Option<Arc<dyn AnalysisBackend>>),
}

/// Assembles an [`Interceptor`]. Any component not supplied is built from
/// the config.
pub struct InterceptorBuilder {
    config: Config,
    router: Option<Router>,
    fastpath: Option<Arc<FastPathCache>>,
    redactor: Option<Arc<Redactor>>,
    bypass: Option<Arc<BypassDetector>>,
    backend: BackendChoice,
    terminal: Option<Arc<dyn TerminalProvider>>,
    auth_store: Option<Arc<dyn AuthCodeStore>>,
    identity: Option<Arc<dyn IdentityProbe>>,
    executor: Option<Arc<dyn Executor>>,
}

impl InterceptorBuilder {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            router: None,
            fastpath: None,
            redactor: None,
            bypass: None,
            backend: BackendChoice::FromConfig,
            terminal: None,
            auth_store: None,
            identity: None,
            executor: None,
        }
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    pub fn fastpath(mut self, cache: Arc<FastPathCache>) -> Self {
        self.fastpath = Some(cache);
        self
    }

    pub fn redactor(mut self, redactor: Arc<Redactor>) -> Self {
        self.redactor = Some(redactor);
        self
    }

    pub fn bypass_detector(mut self, detector: Arc<BypassDetector>) -> Self {
        self.bypass = Some(detector);
        self
    }

    /// Use `backend` for remote analysis; `None` means local fallback only.
    pub fn analysis_backend(mut self, backend: Option<Arc<dyn AnalysisBackend>>) -> Self {
        self.backend = BackendChoice::Fixed(backend);
        self
    }

    pub fn terminal(mut self, terminal: Arc<dyn TerminalProvider>) -> Self {
        self.terminal = Some(terminal);
        self
    }

    pub fn auth_store(mut self, store: Arc<dyn AuthCodeStore>) -> Self {
        self.auth_store = Some(store);
        self
    }

    pub fn identity_probe(mut self, probe: Arc<dyn IdentityProbe>) -> Self {
        self.identity = Some(probe);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Fails only when a configured redaction pattern does not compile.
    pub fn build(self) -> Result<Interceptor, GateError> {
        let config = self.config;
        let redactor = match self.redactor {
            Some(redactor) => redactor,
            None => Arc::new(Redactor::from_settings(&config.redaction)?),
        };
        let evaluator = match self.backend {
            BackendChoice::FromConfig => {
                VerdictEvaluator::from_config(&config.analysis, Arc::clone(&redactor))
            }
            BackendChoice::Fixed(backend) => {
                VerdictEvaluator::new(backend, Arc::clone(&redactor))
            }
        };
        let terminal = self
            .terminal
            .unwrap_or_else(|| Arc::new(DevTtyProvider) as Arc<dyn TerminalProvider>);
        let issuer = match self.auth_store {
            Some(store) => AuthCodeIssuer::new(store, Duration::from_secs(config.auth_codes.ttl_secs)),
            None => AuthCodeIssuer::from_config(&config.auth_codes),
        };
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(ProcessIdentity) as Arc<dyn IdentityProbe>);

        Ok(Interceptor {
            router: Arc::new(self.router.unwrap_or_else(|| Router::from_config(&config))),
            fastpath: self.fastpath.unwrap_or_else(|| {
                Arc::new(
                    FastPathCache::from_config(&config.cache)
                        .with_extra_safe(config.lists.safe.clone()),
                )
            }),
            bypass: self
                .bypass
                .unwrap_or_else(|| Arc::new(BypassDetector::for_current_process(&config.bypass))),
            bypass_threshold: config.bypass.threshold,
            evaluator,
            approval: Arc::new(ApprovalChannel::new(terminal, &config.approval)),
            issuer,
            signer: Arc::new(IntegritySigner::from_config(identity, &config.integrity)),
            executor: self
                .executor
                .unwrap_or_else(|| Arc::new(ProcessExecutor) as Arc<dyn Executor>),
            redactor,
        })
    }
}
