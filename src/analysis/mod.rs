//! Command risk analysis.
//!
//! A verdict comes from one of two places: the remote analysis collaborator
//! (behind [`AnalysisBackend`]) or the local [`fallback`] classifier. The
//! remote side is optional and may fail in any way; the fallback never fails.

pub mod fallback;
pub mod http;
pub mod retry;

pub use fallback::classify;
pub use http::HttpBackend;
pub use retry::RetryBackend;

use crate::context::InterceptionContext;
use crate::error_codes::GateError;
use crate::redact::Redactor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What should happen to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Allow,
    Warn,
    Block,
}

impl Verdict {
    /// Lenient parse of a remote verdict string.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ALLOW" | "SAFE" | "APPROVE" => Some(Self::Allow),
            "WARN" | "WARNING" | "ASK" | "MODERATE" => Some(Self::Warn),
            "BLOCK" | "DENY" | "DANGEROUS" => Some(Self::Block),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allow => "ALLOW",
            Self::Warn => "WARN",
            Self::Block => "BLOCK",
        })
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LOW" | "SAFE" => Some(Self::Low),
            "MEDIUM" | "MODERATE" => Some(Self::Medium),
            "HIGH" | "DANGEROUS" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which classifier produced an [`Analysis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisSource {
    Remote,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub verdict: Verdict,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub explanation: String,
    pub recommendation: String,
    pub affected_resources: Vec<String>,
    pub risks: Vec<String>,
    pub alternatives: Vec<String>,
    pub source: AnalysisSource,
}

impl Analysis {
    /// Risk tier for an approval prompt. A BLOCK is always critical.
    #[must_use]
    pub fn approval_tier(&self) -> RiskLevel {
        match self.verdict {
            Verdict::Block => RiskLevel::Critical,
            Verdict::Allow | Verdict::Warn => self.risk_level,
        }
    }
}

/// Request body sent to the remote collaborator. Command text is redacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub user: String,
    pub platform: String,
    pub is_sudo: bool,
}

impl AnalysisRequest {
    /// Build a request from `ctx`, passing every string through `redactor`.
    #[must_use]
    pub fn from_context(ctx: &InterceptionContext, redactor: &Redactor) -> Self {
        Self {
            command: redactor.redact_text(&ctx.command),
            args: ctx.args.iter().map(|a| redactor.redact_text(a)).collect(),
            cwd: redactor.redact_text(&ctx.cwd.to_string_lossy()),
            user: ctx.user.clone(),
            platform: std::env::consts::OS.to_string(),
            is_sudo: ctx.is_sudo,
        }
    }

    /// The command line as one string, for classifiers that want text.
    #[must_use]
    pub fn command_line(&self) -> String {
        crate::shell::display_line(&self.command, &self.args)
    }
}

/// A remote classifier.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Classify one command. Every failure is an error; callers fall back.
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, GateError>;
}
