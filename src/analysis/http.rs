//! HTTP client for the remote analysis collaborator.

use super::{Analysis, AnalysisBackend, AnalysisRequest, AnalysisSource, RiskLevel, Verdict};
use crate::config::AnalysisConfig;
use crate::error_codes::GateError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Raw response. Every field is optional; [`normalize`] fills the gaps.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAnalysis {
    verdict: Option<String>,
    #[serde(alias = "risk_level")]
    risk_level: Option<String>,
    /// Older classifier servers report a single `risk` label instead.
    risk: Option<String>,
    confidence: Option<f64>,
    #[serde(alias = "reason")]
    explanation: Option<String>,
    recommendation: Option<String>,
    #[serde(default, alias = "affected_resources")]
    affected_resources: Vec<String>,
    #[serde(default)]
    risks: Vec<String>,
    #[serde(default)]
    alternatives: Vec<String>,
}

/// Posts [`AnalysisRequest`] JSON to a classifier endpoint.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpBackend {
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(config.url.clone(), Duration::from_millis(config.timeout_ms))
    }

    /// Use a pre-built client.
    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AnalysisBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, GateError> {
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GateError::analysis_timeout(timeout_ms)
                } else {
                    GateError::analysis_transport(&e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GateError::analysis_transport(&format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            ))
            .add_context("status", status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| GateError::analysis_transport(&e.to_string()))?;
        parse_response(&body)
    }
}

/// Parse and normalize a response body.
pub fn parse_response(body: &str) -> Result<Analysis, GateError> {
    let wire: WireAnalysis =
        serde_json::from_str(body).map_err(|e| GateError::analysis_malformed(&e.to_string()))?;
    Ok(normalize(wire))
}

/// Missing or unrecognized verdict and risk default to WARN / MEDIUM.
fn normalize(wire: WireAnalysis) -> Analysis {
    let verdict = wire
        .verdict
        .as_deref()
        .or(wire.risk.as_deref())
        .and_then(Verdict::parse)
        .unwrap_or(Verdict::Warn);
    let risk_level = wire
        .risk_level
        .as_deref()
        .or(wire.risk.as_deref())
        .and_then(RiskLevel::parse)
        .unwrap_or_default();
    let confidence = wire
        .confidence
        .filter(|c| c.is_finite())
        .map_or(0.5, |c| c.clamp(0.0, 1.0));

    Analysis {
        verdict,
        risk_level,
        confidence,
        explanation: wire.explanation.unwrap_or_default(),
        recommendation: wire.recommendation.unwrap_or_default(),
        affected_resources: wire.affected_resources,
        risks: wire.risks,
        alternatives: wire.alternatives,
        source: AnalysisSource::Remote,
    }
}
