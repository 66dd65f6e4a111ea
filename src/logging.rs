//! Logging initialization.
//!
//! Two formats:
//! - `text`: compact human-readable lines on stderr (or the configured file)
//! - `json`: one JSON object per line for log aggregators
//!
//! Security violations go to the [`SECURITY_TARGET`] target at `warn`, so
//! `SHELLGATE_LOG=shellgate::security=warn` isolates the forensic trail.
//! Command text reaching a log line must already be redacted.

use crate::config::{LogFormat, LoggingConfig};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Target used for forensic security events.
pub const SECURITY_TARGET: &str = "shellgate::security";

/// Build the filter for `cfg`, falling back to `warn` on a bad directive.
#[must_use]
pub fn build_filter(cfg: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_new(&cfg.level).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber.
///
/// Safe to call more than once; later calls are ignored. An unopenable log
/// file falls back to stderr with a warning.
pub fn init_logging(cfg: &LoggingConfig) {
    let filter = build_filter(cfg);

    let file = cfg.file.as_ref().and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(Mutex::new(file)),
            Err(e) => {
                eprintln!("shellgate: cannot open log file {path}: {e}; logging to stderr");
                None
            }
        }
    });

    let result = match (cfg.format, file) {
        (LogFormat::Json, Some(file)) => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(file)
            .try_init(),
        (LogFormat::Json, None) => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
        (LogFormat::Text, Some(file)) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_target(true)
            .compact()
            .with_writer(file)
            .try_init(),
        (LogFormat::Text, None) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .with_writer(std::io::stderr)
            .try_init(),
    };
    // Already installed (tests, embedding); keep the existing subscriber.
    let _ = result;
}

/// Emit a forensic security event on [`SECURITY_TARGET`].
///
/// ```
/// # use shellgate::security_event;
/// security_event!("bypass_detected", method = "pipe", confidence = 0.95);
/// ```
#[macro_export]
macro_rules! security_event {
    ($event:expr) => {
        tracing::warn!(target: "shellgate::security", event = $event)
    };
    ($event:expr, $($key:ident = $val:expr),+ $(,)?) => {
        tracing::warn!(target: "shellgate::security", event = $event, $($key = $val),+)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logging_config() {
        let cfg = LoggingConfig::default();
        assert_eq!(cfg.format, LogFormat::Text);
        assert_eq!(cfg.level, "warn");
        assert!(cfg.file.is_none());
    }

    #[test]
    fn test_bad_directive_falls_back() {
        let cfg = LoggingConfig {
            level: "shellgate=loud".to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(build_filter(&cfg).to_string(), "warn");
    }

    #[test]
    fn test_log_format_deserialize_json() {
        let cfg: LoggingConfig = toml::from_str("format = \"json\"\nlevel = \"debug\"\n").unwrap();
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.level, "debug");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = LoggingConfig {
            file: Some(dir.path().join("gate.log").display().to_string()),
            ..LoggingConfig::default()
        };
        init_logging(&cfg);
        init_logging(&cfg);
        security_event!("test_event", detail = "ok");
    }
}
