//! Message box for outcomes that did not run the command.
//!
//! Renders a bordered box with:
//! - a header naming the outcome
//! - the redacted command line
//! - the reason, and the analysis explanation when there is one
//! - safe alternatives as a bullet list
//! - the redeem command when an auth code was issued
//!
//! Falls back to plain text when colors are off.

use super::redeem_command;
use crate::orchestrator::{InterceptionOutcome, InterceptionReport};
use colored::{ColoredString, Colorize};
use std::fmt::Write;

/// Everything the box shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenialBox {
    pub header: String,
    pub command: String,
    pub reason: String,
    pub explanation: Option<String>,
    pub alternatives: Vec<String>,
    pub auth_code: Option<String>,
}

impl DenialBox {
    /// Box for `report`, or `None` when the command ran.
    #[must_use]
    pub fn from_report(report: &InterceptionReport) -> Option<Self> {
        let (header, reason, auth_code) = match &report.outcome {
            InterceptionOutcome::Executed { .. } => return None,
            InterceptionOutcome::Blocked { reason, .. } => {
                ("BLOCKED: Security check failed", reason, None)
            }
            InterceptionOutcome::Denied { reason, auth_code } => {
                let header = if auth_code.is_some() {
                    "APPROVAL REQUIRED"
                } else {
                    "DENIED"
                };
                (header, reason, auth_code.clone())
            }
            InterceptionOutcome::Errored { reason } => ("ERROR: Command did not start", reason, None),
        };
        let analysis = report.analysis.as_ref();
        Some(Self {
            header: header.to_string(),
            command: report.display.clone(),
            reason: reason.clone(),
            explanation: analysis
                .map(|a| a.explanation.clone())
                .filter(|e| !e.is_empty() && !reason.contains(e.as_str())),
            alternatives: analysis.map(|a| a.alternatives.clone()).unwrap_or_default(),
            auth_code,
        })
    }

    fn lines(&self) -> Vec<String> {
        let mut lines = vec![format!("Command: {}", self.command), String::new()];
        lines.push(format!("Reason: {}", self.reason));
        if let Some(explanation) = &self.explanation {
            lines.push(format!("Analysis: {explanation}"));
        }
        if !self.alternatives.is_empty() {
            lines.push(String::new());
            lines.push("Safer alternatives:".to_string());
            lines.extend(self.alternatives.iter().map(|alt| format!("  - {alt}")));
        }
        if let Some(code) = &self.auth_code {
            lines.push(String::new());
            lines.push(format!("Auth code: {code}"));
            lines.push(format!("A human can approve it with: {}", redeem_command(code)));
        }
        lines
    }

    /// Plain text, for non-TTY contexts.
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "{}", self.header);
        let _ = writeln!(output);
        for line in self.lines() {
            let _ = writeln!(output, "  {line}");
        }
        output
    }

    /// Colored box at most `width` columns wide.
    #[must_use]
    pub fn render(&self, width: usize, color: bool) -> String {
        if !color {
            return self.render_plain();
        }
        let inner = width.saturating_sub(4).max(36);
        let paint = |s: &str| -> ColoredString {
            if self.auth_code.is_some() {
                s.yellow()
            } else {
                s.red()
            }
        };

        let mut output = String::new();
        let _ = writeln!(output, "{}", paint(&format!("╭{}╮", "─".repeat(inner))));
        let header = format!(" {}", self.header);
        let _ = writeln!(
            output,
            "{}{}{}{}",
            paint("│"),
            paint(&header).bold(),
            " ".repeat(inner.saturating_sub(header.chars().count())),
            paint("│")
        );
        let _ = writeln!(output, "{}", paint(&format!("├{}┤", "─".repeat(inner))));
        for line in self.lines() {
            for chunk in wrap(&line, inner.saturating_sub(2)) {
                let pad = inner.saturating_sub(chunk.chars().count() + 2);
                let _ = writeln!(
                    output,
                    "{}  {}{}{}",
                    paint("│"),
                    chunk,
                    " ".repeat(pad),
                    paint("│")
                );
            }
        }
        let _ = writeln!(output, "{}", paint(&format!("╰{}╯", "─".repeat(inner))));
        output
    }
}

/// Split `line` into chunks of at most `width` characters.
fn wrap(line: &str, width: usize) -> Vec<String> {
    if line.is_empty() || width == 0 {
        return vec![String::new()];
    }
    let chars: Vec<char> = line.chars().collect();
    chars.chunks(width).map(|c| c.iter().collect()).collect()
}
