//! Standardized error codes for shellgate.
//!
//! Error codes follow the format `SG-XXXX` where:
//!
//! - SG-1xxx: Analysis failures (recovered locally, never surfaced as denials on their own)
//! - SG-2xxx: Security violations (never retried, always resolved to denial)
//! - SG-3xxx: Environment failures (denied with an actionable reason)
//! - SG-4xxx: Internal errors (caught at the top level, resolved to denial)
//!
//! # Example
//!
//! ```ignore
//! use shellgate::error_codes::{GateError, ErrorCode};
//!
//! let error = GateError::no_terminal("open /dev/tty: No such device or address");
//! println!("{}", error.to_json());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Error categories, mirroring how each class of failure is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Remote analysis failures (SG-1xxx).
    Analysis,
    /// Bypass, integrity, and auth-code violations (SG-2xxx).
    SecurityViolation,
    /// Missing terminal, missing binary, unreadable config (SG-3xxx).
    Environment,
    /// Anything unexpected inside the pipeline (SG-4xxx).
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Analysis => write!(f, "analysis"),
            Self::SecurityViolation => write!(f, "security_violation"),
            Self::Environment => write!(f, "environment"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Standardized error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // SG-1xxx: analysis failures
    /// SG-1001: Remote analysis timed out
    #[serde(rename = "SG-1001")]
    AnalysisTimeout,

    /// SG-1002: Remote analysis transport error
    #[serde(rename = "SG-1002")]
    AnalysisTransport,

    /// SG-1003: Remote analysis returned an unusable response
    #[serde(rename = "SG-1003")]
    AnalysisMalformed,

    /// SG-1004: Remote analysis is not configured
    #[serde(rename = "SG-1004")]
    AnalysisUnavailable,

    // SG-2xxx: security violations
    /// SG-2001: Bypass attempt detected
    #[serde(rename = "SG-2001")]
    BypassDetected,

    /// SG-2002: Command integrity verification failed
    #[serde(rename = "SG-2002")]
    IntegrityCheckFailed,

    /// SG-2003: Auth code unknown
    #[serde(rename = "SG-2003")]
    AuthCodeUnknown,

    /// SG-2004: Auth code already used
    #[serde(rename = "SG-2004")]
    AuthCodeReused,

    /// SG-2005: Auth code expired
    #[serde(rename = "SG-2005")]
    AuthCodeExpired,

    /// SG-2006: Response arrived faster than a human could type it
    #[serde(rename = "SG-2006")]
    AutomatedResponse,

    /// SG-2007: Guarded variable manipulated through a builtin
    #[serde(rename = "SG-2007")]
    GuardedVariable,

    // SG-3xxx: environment failures
    /// SG-3001: No controlling terminal
    #[serde(rename = "SG-3001")]
    NoTerminal,

    /// SG-3002: Command not found
    #[serde(rename = "SG-3002")]
    CommandNotFound,

    /// SG-3003: Configuration file could not be parsed
    #[serde(rename = "SG-3003")]
    ConfigParseError,

    /// SG-3004: Auth-code store unavailable
    #[serde(rename = "SG-3004")]
    StoreUnavailable,

    /// SG-3005: Working directory unavailable
    #[serde(rename = "SG-3005")]
    WorkingDirUnavailable,

    // SG-4xxx: internal errors
    /// SG-4001: Pipeline task panicked or was cancelled
    #[serde(rename = "SG-4001")]
    TaskFailed,

    /// SG-4002: Process spawn failed
    #[serde(rename = "SG-4002")]
    SpawnFailed,

    /// SG-4003: I/O error
    #[serde(rename = "SG-4003")]
    IoError,

    /// SG-4004: Invalid pattern
    #[serde(rename = "SG-4004")]
    InvalidPattern,
}

impl ErrorCode {
    /// Get the code as a string (e.g., "SG-2001").
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AnalysisTimeout => "SG-1001",
            Self::AnalysisTransport => "SG-1002",
            Self::AnalysisMalformed => "SG-1003",
            Self::AnalysisUnavailable => "SG-1004",
            Self::BypassDetected => "SG-2001",
            Self::IntegrityCheckFailed => "SG-2002",
            Self::AuthCodeUnknown => "SG-2003",
            Self::AuthCodeReused => "SG-2004",
            Self::AuthCodeExpired => "SG-2005",
            Self::AutomatedResponse => "SG-2006",
            Self::GuardedVariable => "SG-2007",
            Self::NoTerminal => "SG-3001",
            Self::CommandNotFound => "SG-3002",
            Self::ConfigParseError => "SG-3003",
            Self::StoreUnavailable => "SG-3004",
            Self::WorkingDirUnavailable => "SG-3005",
            Self::TaskFailed => "SG-4001",
            Self::SpawnFailed => "SG-4002",
            Self::IoError => "SG-4003",
            Self::InvalidPattern => "SG-4004",
        }
    }

    /// Get the error category for this code.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::AnalysisTimeout
            | Self::AnalysisTransport
            | Self::AnalysisMalformed
            | Self::AnalysisUnavailable => ErrorCategory::Analysis,

            Self::BypassDetected
            | Self::IntegrityCheckFailed
            | Self::AuthCodeUnknown
            | Self::AuthCodeReused
            | Self::AuthCodeExpired
            | Self::AutomatedResponse
            | Self::GuardedVariable => ErrorCategory::SecurityViolation,

            Self::NoTerminal
            | Self::CommandNotFound
            | Self::ConfigParseError
            | Self::StoreUnavailable
            | Self::WorkingDirUnavailable => ErrorCategory::Environment,

            Self::TaskFailed | Self::SpawnFailed | Self::IoError | Self::InvalidPattern => {
                ErrorCategory::Internal
            }
        }
    }

    /// Get a human-readable description of the error code.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::AnalysisTimeout => "Remote analysis timed out",
            Self::AnalysisTransport => "Remote analysis request failed",
            Self::AnalysisMalformed => "Remote analysis response was malformed",
            Self::AnalysisUnavailable => "Remote analysis is not configured",
            Self::BypassDetected => "Bypass attempt detected",
            Self::IntegrityCheckFailed => "Command integrity verification failed",
            Self::AuthCodeUnknown => "Auth code is unknown",
            Self::AuthCodeReused => "Auth code was already used",
            Self::AuthCodeExpired => "Auth code has expired",
            Self::AutomatedResponse => "Approval response was too fast to be human",
            Self::GuardedVariable => "Guarded variable modification refused",
            Self::NoTerminal => "No controlling terminal available",
            Self::CommandNotFound => "Command not found",
            Self::ConfigParseError => "Failed to parse configuration file",
            Self::StoreUnavailable => "Auth-code store unavailable",
            Self::WorkingDirUnavailable => "Working directory unavailable",
            Self::TaskFailed => "Interception task failed",
            Self::SpawnFailed => "Failed to spawn process",
            Self::IoError => "IO error",
            Self::InvalidPattern => "Invalid pattern",
        }
    }

    /// Whether a failure with this code may ever be retried.
    ///
    /// Security violations are terminal.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AnalysisTimeout | Self::AnalysisTransport | Self::StoreUnavailable
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A structured error with code, category, message, and context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateError {
    /// The error code (e.g., "SG-2001")
    pub code: String,

    /// The error category
    pub category: ErrorCategory,

    /// Human-readable error message
    pub message: String,

    /// Additional context about the error
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl GateError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            category: code.category(),
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Add a context field to the error.
    #[must_use]
    pub fn add_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// True when the error belongs to the security-violation category.
    #[must_use]
    pub fn is_security_violation(&self) -> bool {
        self.category == ErrorCategory::SecurityViolation
    }

    /// True when the failure is transient and the operation may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        [
            ErrorCode::AnalysisTimeout,
            ErrorCode::AnalysisTransport,
            ErrorCode::StoreUnavailable,
        ]
        .iter()
        .any(|code| code.is_retryable() && code.as_str() == self.code)
    }

    #[must_use]
    pub fn analysis_timeout(timeout_ms: u64) -> Self {
        Self::new(
            ErrorCode::AnalysisTimeout,
            format!("Remote analysis timed out after {timeout_ms}ms"),
        )
        .add_context("timeout_ms", timeout_ms)
    }

    #[must_use]
    pub fn analysis_transport(details: &str) -> Self {
        Self::new(
            ErrorCode::AnalysisTransport,
            format!("Remote analysis request failed: {details}"),
        )
    }

    #[must_use]
    pub fn analysis_malformed(details: &str) -> Self {
        Self::new(
            ErrorCode::AnalysisMalformed,
            format!("Remote analysis response was malformed: {details}"),
        )
    }

    #[must_use]
    pub fn bypass_detected(method: &str, confidence: f64, details: &str) -> Self {
        Self::new(
            ErrorCode::BypassDetected,
            format!("Bypass attempt detected ({method}, confidence {confidence:.2}): {details}"),
        )
        .add_context("method", method)
        .add_context("confidence", confidence)
    }

    #[must_use]
    pub fn integrity_failed(details: &str) -> Self {
        Self::new(
            ErrorCode::IntegrityCheckFailed,
            format!("Command integrity verification failed: {details}"),
        )
    }

    #[must_use]
    pub fn no_terminal(details: &str) -> Self {
        Self::new(
            ErrorCode::NoTerminal,
            format!("No controlling terminal available: {details}"),
        )
    }

    #[must_use]
    pub fn command_not_found(command: &str) -> Self {
        Self::new(
            ErrorCode::CommandNotFound,
            format!("Command not found: {command}. Check the spelling or your PATH."),
        )
        .add_context("command", command)
    }

    #[must_use]
    pub fn config_parse_error(path: &str, details: &str) -> Self {
        Self::new(
            ErrorCode::ConfigParseError,
            format!("Failed to parse configuration file '{path}': {details}"),
        )
        .add_context("path", path)
    }

    #[must_use]
    pub fn store_unavailable(path: &str, details: &str) -> Self {
        Self::new(
            ErrorCode::StoreUnavailable,
            format!("Auth-code store '{path}' unavailable: {details}"),
        )
        .add_context("path", path)
    }

    #[must_use]
    pub fn task_failed(details: &str) -> Self {
        Self::new(
            ErrorCode::TaskFailed,
            format!("Interception task failed: {details}"),
        )
    }

    #[must_use]
    pub fn spawn_failed(command: &str, details: &str) -> Self {
        Self::new(
            ErrorCode::SpawnFailed,
            format!("Failed to spawn '{command}': {details}"),
        )
        .add_context("command", command)
    }

    #[must_use]
    pub fn io_error(operation: &str, details: &str) -> Self {
        Self::new(
            ErrorCode::IoError,
            format!("IO error during {operation}: {details}"),
        )
        .add_context("operation", operation)
    }

    /// Convert to JSON string.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","category":"{}","message":"{}"}}"#,
                self.code, self.category, self.message
            )
        })
    }
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for GateError {}

impl From<std::io::Error> for GateError {
    fn from(err: std::io::Error) -> Self {
        Self::io_error("io", &err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_as_str() {
        assert_eq!(ErrorCode::AnalysisTimeout.as_str(), "SG-1001");
        assert_eq!(ErrorCode::BypassDetected.as_str(), "SG-2001");
        assert_eq!(ErrorCode::NoTerminal.as_str(), "SG-3001");
        assert_eq!(ErrorCode::TaskFailed.as_str(), "SG-4001");
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(
            ErrorCode::AnalysisMalformed.category(),
            ErrorCategory::Analysis
        );
        assert_eq!(
            ErrorCode::AuthCodeReused.category(),
            ErrorCategory::SecurityViolation
        );
        assert_eq!(
            ErrorCode::CommandNotFound.category(),
            ErrorCategory::Environment
        );
        assert_eq!(ErrorCode::SpawnFailed.category(), ErrorCategory::Internal);
    }

    #[test]
    fn test_security_violations_are_never_retryable() {
        let codes = [
            ErrorCode::BypassDetected,
            ErrorCode::IntegrityCheckFailed,
            ErrorCode::AuthCodeUnknown,
            ErrorCode::AuthCodeReused,
            ErrorCode::AuthCodeExpired,
            ErrorCode::AutomatedResponse,
            ErrorCode::GuardedVariable,
        ];
        for code in codes {
            assert_eq!(code.category(), ErrorCategory::SecurityViolation);
            assert!(!code.is_retryable(), "{code} must not be retryable");
        }
    }

    #[test]
    fn test_gate_error_with_context() {
        let error = GateError::bypass_detected("pipe", 0.95, "stdin is a FIFO");
        assert_eq!(error.code, "SG-2001");
        assert!(error.is_security_violation());
        assert!(error.context.contains_key("method"));
        assert!(error.message.contains("0.95"));
    }

    #[test]
    fn test_gate_error_json_serialization() {
        let error = GateError::no_terminal("ENXIO");
        let json = error.to_json();
        assert!(json.contains("SG-3001"));
        assert!(json.contains("environment"));
    }

    #[test]
    fn test_error_display() {
        let error = GateError::io_error("store write", "disk full");
        let display = error.to_string();
        assert!(display.contains("[SG-4003]"));
        assert!(display.contains("disk full"));
    }
}
