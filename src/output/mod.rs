//! Output formatting for shellgate.
//!
//! # Module Structure
//!
//! - `denial` - boxed message for blocked, denied, and errored outcomes
//!
//! Agents get a JSON [`Decision`] on stdout instead (`--json`).
//!
//! # Color Detection
//!
//! Rich output is used when all of the following hold:
//! 1. config `general.color` is not `never` (`always` skips the other checks)
//! 2. `NO_COLOR` is not set
//! 3. stderr is a TTY
//! 4. `TERM` is not `dumb`

pub mod denial;

pub use denial::DenialBox;

use crate::analysis::Verdict;
use crate::bypass::BypassSignal;
use crate::orchestrator::{InterceptionOutcome, InterceptionReport};
use crate::router::RoutingDecision;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::IsTerminal;

/// Decide whether to emit ANSI colors for `mode` ("auto", "always", "never").
#[must_use]
pub fn should_use_color(mode: &str, env: &BTreeMap<String, String>) -> bool {
    match mode {
        "always" => true,
        "never" => false,
        _ => {
            !env.contains_key("NO_COLOR")
                && std::io::stderr().is_terminal()
                && env.get("TERM").is_none_or(|term| term != "dumb")
        }
    }
}

/// Apply the color decision globally for `colored`.
pub fn init(mode: &str, env: &BTreeMap<String, String>) {
    colored::control::set_override(should_use_color(mode, env));
}

/// Terminal width from `COLUMNS`, or 80.
#[must_use]
pub fn terminal_width(env: &BTreeMap<String, String>) -> usize {
    env.get("COLUMNS")
        .and_then(|c| c.parse::<usize>().ok())
        .filter(|w| *w >= 40)
        .unwrap_or(80)
}

/// Machine-readable decision object for agents.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub decision: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeem_command: Option<String>,
    pub route: Option<RoutingDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bypass: Option<BypassSignal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
}

impl Decision {
    #[must_use]
    pub fn from_report(report: &InterceptionReport) -> Self {
        let auth_code = match &report.outcome {
            InterceptionOutcome::Denied { auth_code, .. } => auth_code.clone(),
            _ => None,
        };
        let exit_code = match report.outcome {
            InterceptionOutcome::Executed { exit_code } => Some(exit_code),
            _ => None,
        };
        Self {
            decision: report.outcome.label(),
            reason: report.outcome.reason().map(str::to_string),
            exit_code,
            redeem_command: auth_code.as_deref().map(redeem_command),
            auth_code,
            route: report.route.clone(),
            bypass: report.bypass.clone(),
            verdict: report.analysis.as_ref().map(|a| a.verdict),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"decision":"{}"}}"#, self.decision)
        })
    }
}

/// Command a human runs to redeem `code`.
#[must_use]
pub fn redeem_command(code: &str) -> String {
    format!("shellgate redeem {code}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::InterceptionOutcome;

    fn report(outcome: InterceptionOutcome) -> InterceptionReport {
        InterceptionReport {
            outcome,
            display: "git push --force".into(),
            route: None,
            bypass: None,
            analysis: None,
            approval: None,
        }
    }

    #[test]
    fn denial_with_code_carries_redeem_command() {
        let decision = Decision::from_report(&report(InterceptionOutcome::Denied {
            reason: "Approval required".into(),
            auth_code: Some("amber-falcon-42".into()),
        }));
        let json: serde_json::Value = serde_json::from_str(&decision.to_json()).unwrap();
        assert_eq!(json["decision"], "denied");
        assert_eq!(json["authCode"], "amber-falcon-42");
        assert_eq!(json["redeemCommand"], "shellgate redeem amber-falcon-42");
        assert!(json.get("bypass").is_none());
    }

    #[test]
    fn executed_reports_exit_code() {
        let decision = Decision::from_report(&report(InterceptionOutcome::Executed { exit_code: 5 }));
        let json: serde_json::Value = serde_json::from_str(&decision.to_json()).unwrap();
        assert_eq!(json["decision"], "executed");
        assert_eq!(json["exitCode"], 5);
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn color_modes() {
        let env = BTreeMap::new();
        assert!(should_use_color("always", &env));
        assert!(!should_use_color("never", &env));
        let no_color = BTreeMap::from([("NO_COLOR".to_string(), "1".to_string())]);
        assert!(!should_use_color("auto", &no_color));
    }

    #[test]
    fn width_defaults() {
        assert_eq!(terminal_width(&BTreeMap::new()), 80);
        let narrow = BTreeMap::from([("COLUMNS".to_string(), "10".to_string())]);
        assert_eq!(terminal_width(&narrow), 80);
        let wide = BTreeMap::from([("COLUMNS".to_string(), "120".to_string())]);
        assert_eq!(terminal_width(&wide), 120);
    }
}
