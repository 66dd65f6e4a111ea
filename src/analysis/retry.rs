//! Timeout and exponential-backoff retry around any [`AnalysisBackend`].

use super::{Analysis, AnalysisBackend, AnalysisRequest};
use crate::config::AnalysisConfig;
use crate::error_codes::GateError;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Decorator that bounds every attempt with a timeout and retries transient
/// failures. Non-transient errors (malformed responses) return immediately.
pub struct RetryBackend {
    inner: Arc<dyn AnalysisBackend>,
    max_retries: u32,
    attempt_timeout: Duration,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl std::fmt::Debug for RetryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryBackend")
            .field("inner", &self.inner.name())
            .field("max_retries", &self.max_retries)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .finish()
    }
}

impl RetryBackend {
    pub fn new(inner: Arc<dyn AnalysisBackend>) -> Self {
        Self {
            inner,
            max_retries: 2,
            attempt_timeout: Duration::from_secs(5),
            base_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }

    pub fn from_config(inner: Arc<dyn AnalysisBackend>, config: &AnalysisConfig) -> Self {
        Self::new(inner)
            .with_max_retries(config.max_retries)
            .with_attempt_timeout(Duration::from_millis(config.timeout_ms))
            .with_base_delay_ms(config.base_delay_ms)
            .with_max_delay_ms(config.max_delay_ms)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }
}

/// `min(base * 2^attempt + jitter, max)`.
#[must_use]
pub fn compute_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64, jitter_ms: u64) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(16));
    exponential.saturating_add(jitter_ms).min(max_delay_ms)
}

#[async_trait]
impl AnalysisBackend for RetryBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, GateError> {
        let timeout_ms = u64::try_from(self.attempt_timeout.as_millis()).unwrap_or(u64::MAX);
        let mut attempt = 0;
        loop {
            let result =
                match tokio::time::timeout(self.attempt_timeout, self.inner.analyze(request)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(GateError::analysis_timeout(timeout_ms)),
                };
            match result {
                Ok(analysis) => return Ok(analysis),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let jitter = rand::thread_rng().gen_range(0..self.base_delay_ms.max(1));
                    let delay =
                        compute_delay(attempt, self.base_delay_ms, self.max_delay_ms, jitter);
                    tracing::warn!(
                        backend = self.inner.name(),
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay,
                        error = %err,
                        "analysis failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(err) => {
                    if attempt > 0 {
                        tracing::warn!(
                            backend = self.inner.name(),
                            attempts = attempt + 1,
                            error = %err,
                            "analysis retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
