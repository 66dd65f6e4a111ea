//! Verdict acquisition for commands the router could not clear.
//!
//! # Architecture
//!
//! Two classifiers run concurrently:
//!
//! 1. **Remote analysis** - the optional [`AnalysisBackend`], wrapped in
//!    timeout and retry. Its request carries only redacted text.
//! 2. **Local fallback** - the pattern classifier in
//!    [`crate::analysis::fallback`]. It never fails.
//!
//! The results are then combined:
//!
//! - a remote failure of any kind is logged and replaced by the local result
//! - a local BLOCK is a floor: the remote side can never lower it
//! - a route that requires approval never gets a bare ALLOW; it becomes WARN
//!
//! # Example
//!
//! ```ignore
//! use shellgate::evaluator::VerdictEvaluator;
//!
//! let evaluator = VerdictEvaluator::local_only(redactor);
//! let analysis = evaluator.evaluate(&ctx, &decision).await;
//! match analysis.verdict {
//!     Verdict::Allow => run(),
//!     Verdict::Warn => ask(),
//!     Verdict::Block => refuse(),
//! }
//! ```

use crate::analysis::{
    Analysis, AnalysisBackend, AnalysisRequest, HttpBackend, RetryBackend, RiskLevel, Verdict,
    fallback,
};
use crate::config::AnalysisConfig;
use crate::context::InterceptionContext;
use crate::error_codes::GateError;
use crate::redact::Redactor;
use crate::router::RoutingDecision;
use std::sync::Arc;

/// Produces an [`Analysis`] for a routed command.
#[derive(Clone)]
pub struct VerdictEvaluator {
    backend: Option<Arc<dyn AnalysisBackend>>,
    redactor: Arc<Redactor>,
}

impl std::fmt::Debug for VerdictEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerdictEvaluator")
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl VerdictEvaluator {
    #[must_use]
    pub fn new(backend: Option<Arc<dyn AnalysisBackend>>, redactor: Arc<Redactor>) -> Self {
        Self { backend, redactor }
    }

    /// Fallback classification only.
    #[must_use]
    pub fn local_only(redactor: Arc<Redactor>) -> Self {
        Self::new(None, redactor)
    }

    /// HTTP backend with retry when analysis is enabled.
    #[must_use]
    pub fn from_config(config: &AnalysisConfig, redactor: Arc<Redactor>) -> Self {
        let backend: Option<Arc<dyn AnalysisBackend>> = config.enabled.then(|| {
            let http: Arc<dyn AnalysisBackend> = Arc::new(HttpBackend::from_config(config));
            Arc::new(RetryBackend::from_config(http, config)) as Arc<dyn AnalysisBackend>
        });
        Self::new(backend, redactor)
    }

    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.backend.is_some()
    }

    /// Classify `ctx` under `route`. Never fails.
    pub async fn evaluate(&self, ctx: &InterceptionContext, route: &RoutingDecision) -> Analysis {
        let request = AnalysisRequest::from_context(ctx, &self.redactor);

        let remote = async {
            match &self.backend {
                Some(backend) => Some(backend.analyze(&request).await),
                None => None,
            }
        };
        let local = async { fallback::classify(&ctx.command, &ctx.args) };
        let (remote, local) = tokio::join!(remote, local);

        combine(remote, local, route.requires_approval)
    }
}

/// Merge a remote result (if any) with the local classification.
#[must_use]
pub fn combine(
    remote: Option<Result<Analysis, GateError>>,
    local: Analysis,
    requires_approval: bool,
) -> Analysis {
    let mut chosen = match remote {
        Some(Ok(analysis)) => {
            if local.verdict == Verdict::Block && analysis.verdict != Verdict::Block {
                tracing::warn!(
                    remote = %analysis.verdict,
                    "remote verdict below local BLOCK, keeping local"
                );
                local
            } else {
                analysis
            }
        }
        Some(Err(err)) => {
            tracing::warn!(
                code = %err.code,
                error = %err.message,
                "remote analysis unavailable, using fallback classifier"
            );
            local
        }
        None => local,
    };

    if requires_approval && chosen.verdict == Verdict::Allow {
        chosen.verdict = Verdict::Warn;
        chosen.risk_level = chosen.risk_level.max(RiskLevel::Medium);
        chosen.recommendation = "Confirm before running: this command always needs approval".into();
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisSource;
    use async_trait::async_trait;

    struct Fixed(Result<Analysis, fn() -> GateError>);

    #[async_trait]
    impl AnalysisBackend for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn analyze(&self, _request: &AnalysisRequest) -> Result<Analysis, GateError> {
            match &self.0 {
                Ok(analysis) => Ok(analysis.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    fn remote(verdict: Verdict, risk: RiskLevel) -> Analysis {
        Analysis {
            verdict,
            risk_level: risk,
            confidence: 0.9,
            explanation: "remote says so".into(),
            recommendation: String::new(),
            affected_resources: vec![],
            risks: vec![],
            alternatives: vec![],
            source: AnalysisSource::Remote,
        }
    }

    fn ctx(command: &str, args: &[&str]) -> InterceptionContext {
        InterceptionContext::builder(command, args.iter().map(|s| (*s).to_string()).collect())
            .build()
    }

    fn evaluator(backend: Fixed) -> VerdictEvaluator {
        VerdictEvaluator::new(Some(Arc::new(backend)), Arc::new(Redactor::new()))
    }

    #[tokio::test]
    async fn remote_failure_falls_back() {
        let ctx = ctx("rm", &["-rf", "/"]);
        let route = crate::router::route(&ctx.command, &ctx.args, &ctx);
        let eval = evaluator(Fixed(Err(|| GateError::analysis_transport("refused"))));
        let analysis = eval.evaluate(&ctx, &route).await;
        assert_eq!(analysis.verdict, Verdict::Block);
        assert_eq!(analysis.source, AnalysisSource::Fallback);
    }

    #[tokio::test]
    async fn remote_cannot_lower_local_block() {
        let ctx = ctx("rm", &["-rf", "/"]);
        let route = crate::router::route(&ctx.command, &ctx.args, &ctx);
        let eval = evaluator(Fixed(Ok(remote(Verdict::Allow, RiskLevel::Low))));
        let analysis = eval.evaluate(&ctx, &route).await;
        assert_eq!(analysis.verdict, Verdict::Block);
    }

    #[tokio::test]
    async fn remote_can_raise_verdict() {
        let ctx = ctx("make", &["deploy"]);
        let route = crate::router::route(&ctx.command, &ctx.args, &ctx);
        let eval = evaluator(Fixed(Ok(remote(Verdict::Block, RiskLevel::Critical))));
        let analysis = eval.evaluate(&ctx, &route).await;
        assert_eq!(analysis.verdict, Verdict::Block);
        assert_eq!(analysis.source, AnalysisSource::Remote);
    }

    #[test]
    fn allow_escalates_when_approval_required() {
        let local = fallback::classify("ls", &[]);
        assert_eq!(local.verdict, Verdict::Allow);
        let combined = combine(Some(Ok(remote(Verdict::Allow, RiskLevel::Low))), local, true);
        assert_eq!(combined.verdict, Verdict::Warn);
        assert_eq!(combined.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn allow_stands_without_approval() {
        let local = fallback::classify("make", &["test".into()]);
        let combined = combine(Some(Ok(remote(Verdict::Allow, RiskLevel::Low))), local, false);
        assert_eq!(combined.verdict, Verdict::Allow);
    }

    #[tokio::test]
    async fn local_only_never_calls_out() {
        let eval = VerdictEvaluator::local_only(Arc::new(Redactor::new()));
        assert!(!eval.has_remote());
        let ctx = ctx("git", &["push", "--force"]);
        let route = crate::router::route(&ctx.command, &ctx.args, &ctx);
        let analysis = eval.evaluate(&ctx, &route).await;
        assert_eq!(analysis.verdict, Verdict::Warn);
    }
}
