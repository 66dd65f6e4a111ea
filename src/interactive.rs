//! Human approval over the controlling terminal.
//!
//! One approval is a fixed sequence: open the terminal, flush stale input,
//! display the warning, prompt, validate, close. Every failure along the way
//! resolves to a denial.
//!
//! # Security Model
//!
//! - **Trusted channel**: the prompt is written to and read from `/dev/tty`,
//!   never the process's own stdin/stdout.
//! - **Stale input**: anything typed (or injected) before the prompt appeared
//!   is discarded.
//! - **Risk tiers**: a CRITICAL command needs the full confirmation word;
//!   lower tiers accept `y` / `yes`.
//! - **Timing**: an answer faster than a human could read the prompt is
//!   treated as automation and denied.

use crate::analysis::{Analysis, RiskLevel};
use crate::config::ApprovalConfig;
use crate::terminal::{ReadOutcome, TerminalChannel, TerminalProvider};
use colored::Colorize;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

/// Minimum timeout in seconds.
pub const MIN_TIMEOUT_SECONDS: u64 = 1;

/// Maximum timeout in seconds.
pub const MAX_TIMEOUT_SECONDS: u64 = 300;

/// Answers that approve a non-critical prompt.
const YES_WORDS: &[&str] = &["y", "yes"];

/// Answers that are explicit refusals.
const NO_WORDS: &[&str] = &["", "n", "no"];

const WIDTH: usize = 66;

/// Step of an approval, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStep {
    OpenTerminal,
    FlushStaleInput,
    DisplayWarning,
    Prompt,
    Validate,
    Close,
}

/// What the prompt should show.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// Command line, already redacted.
    pub command_line: String,
    pub reason: String,
    pub tier: RiskLevel,
    pub analysis: Option<Analysis>,
}

impl ApprovalRequest {
    /// Request whose tier derives from `analysis` when present.
    #[must_use]
    pub fn new(
        command_line: impl Into<String>,
        reason: impl Into<String>,
        analysis: Option<Analysis>,
    ) -> Self {
        let tier = analysis
            .as_ref()
            .map_or(RiskLevel::High, Analysis::approval_tier);
        Self {
            command_line: command_line.into(),
            reason: reason.into(),
            tier,
            analysis,
        }
    }
}

/// Outcome of one approval prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResult {
    pub approved: bool,
    pub reason: String,
    pub response_time_ms: u64,
    pub suspicious: bool,
    /// The answer was one the prompt recognizes.
    pub valid_input: bool,
}

impl ApprovalResult {
    fn denied(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
            response_time_ms: 0,
            suspicious: false,
            valid_input: false,
        }
    }
}

/// Clamp a configured timeout to `1..=300` seconds.
#[must_use]
pub fn clamp_timeout(seconds: u64) -> Duration {
    Duration::from_secs(seconds.clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS))
}

/// How an answer relates to the prompt's tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Approve,
    Refuse,
    /// Not an answer this tier accepts.
    Invalid,
}

/// Interpret `input` for `tier`. Comparison ignores case and surrounding
/// whitespace.
#[must_use]
pub fn interpret_answer(input: &str, tier: RiskLevel, confirm_word: &str) -> Answer {
    let input = input.trim();
    let lower = input.to_ascii_lowercase();
    if NO_WORDS.contains(&lower.as_str()) {
        return Answer::Refuse;
    }
    let approves = match tier {
        RiskLevel::Critical => input.eq_ignore_ascii_case(confirm_word.trim()),
        RiskLevel::Low | RiskLevel::Medium | RiskLevel::High => {
            YES_WORDS.contains(&lower.as_str()) || input.eq_ignore_ascii_case(confirm_word.trim())
        }
    };
    if approves { Answer::Approve } else { Answer::Invalid }
}

/// Risk-tiered approval prompts over a [`TerminalProvider`].
pub struct ApprovalChannel {
    terminal: Arc<dyn TerminalProvider>,
    timeout: Duration,
    min_response: Duration,
    confirm_word: String,
}

impl std::fmt::Debug for ApprovalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalChannel")
            .field("timeout", &self.timeout)
            .field("min_response", &self.min_response)
            .field("confirm_word", &self.confirm_word)
            .finish_non_exhaustive()
    }
}

impl ApprovalChannel {
    #[must_use]
    pub fn new(terminal: Arc<dyn TerminalProvider>, config: &ApprovalConfig) -> Self {
        Self {
            terminal,
            timeout: clamp_timeout(config.timeout_secs),
            min_response: Duration::from_millis(config.min_response_ms),
            confirm_word: config.confirm_word.clone(),
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a trusted terminal is reachable.
    #[must_use]
    pub fn terminal_available(&self) -> bool {
        self.terminal.available()
    }

    /// Run one approval. Blocks the calling thread for at most the timeout;
    /// setting `cancel` ends it early as a denial.
    pub fn request(&self, request: &ApprovalRequest, cancel: &AtomicBool) -> ApprovalResult {
        tracing::debug!(step = ?ApprovalStep::OpenTerminal, tier = %request.tier, "approval");
        let mut channel = match self.terminal.open() {
            Ok(channel) => channel,
            Err(err) => {
                tracing::debug!(error = %err, "terminal unavailable");
                return ApprovalResult::denied("no controlling terminal");
            }
        };
        let result = self.run(channel.as_mut(), request, cancel);
        let closing = if result.approved {
            format!("{}\n", "Approved.".green().bold())
        } else {
            format!("{} {}\n", "Denied:".red().bold(), result.reason)
        };
        let _ = channel.write_text(&closing);
        tracing::debug!(step = ?ApprovalStep::Close, approved = result.approved, "approval");
        result
    }

    fn run(
        &self,
        channel: &mut dyn TerminalChannel,
        request: &ApprovalRequest,
        cancel: &AtomicBool,
    ) -> ApprovalResult {
        tracing::debug!(step = ?ApprovalStep::FlushStaleInput, "approval");
        if let Err(e) = channel.flush_input() {
            return ApprovalResult::denied(format!("could not flush terminal input: {e}"));
        }

        tracing::debug!(step = ?ApprovalStep::DisplayWarning, "approval");
        let prompt = render_prompt(request, self.timeout, &self.confirm_word);
        if let Err(e) = channel.write_text(&prompt) {
            return ApprovalResult::denied(format!("could not write to terminal: {e}"));
        }

        tracing::debug!(step = ?ApprovalStep::Prompt, "approval");
        let started = Instant::now();
        let outcome = channel.read_line(self.timeout, cancel);
        let elapsed = started.elapsed();
        let response_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        tracing::debug!(step = ?ApprovalStep::Validate, response_time_ms, "approval");
        let line = match outcome {
            Ok(ReadOutcome::Line(line)) => line,
            Ok(ReadOutcome::TimedOut) => {
                return ApprovalResult {
                    response_time_ms,
                    ..ApprovalResult::denied(format!(
                        "timed out after {}s",
                        self.timeout.as_secs()
                    ))
                };
            }
            Ok(ReadOutcome::Cancelled) => {
                return ApprovalResult {
                    response_time_ms,
                    ..ApprovalResult::denied("approval cancelled")
                };
            }
            Ok(ReadOutcome::Closed) => {
                return ApprovalResult {
                    response_time_ms,
                    ..ApprovalResult::denied("terminal closed")
                };
            }
            Err(e) => {
                return ApprovalResult {
                    response_time_ms,
                    ..ApprovalResult::denied(format!("terminal read failed: {e}"))
                };
            }
        };

        let answer = interpret_answer(&line, request.tier, &self.confirm_word);
        if elapsed < self.min_response {
            crate::security_event!(
                "automated_response",
                response_time_ms = response_time_ms,
                floor_ms = u64::try_from(self.min_response.as_millis()).unwrap_or(u64::MAX)
            );
            return ApprovalResult {
                approved: false,
                reason: format!("response in {response_time_ms}ms is too fast to be human"),
                response_time_ms,
                suspicious: true,
                valid_input: answer != Answer::Invalid,
            };
        }

        match answer {
            Answer::Approve => ApprovalResult {
                approved: true,
                reason: "approved by user".to_string(),
                response_time_ms,
                suspicious: false,
                valid_input: true,
            },
            Answer::Refuse => ApprovalResult {
                approved: false,
                reason: "declined by user".to_string(),
                response_time_ms,
                suspicious: false,
                valid_input: true,
            },
            Answer::Invalid => ApprovalResult {
                approved: false,
                reason: if request.tier == RiskLevel::Critical {
                    format!("critical risk requires typing '{}'", self.confirm_word)
                } else {
                    "unrecognized answer".to_string()
                },
                response_time_ms,
                suspicious: false,
                valid_input: false,
            },
        }
    }
}

fn tier_label(tier: RiskLevel) -> colored::ColoredString {
    match tier {
        RiskLevel::Critical => tier.as_str().red().bold(),
        RiskLevel::High => tier.as_str().red(),
        RiskLevel::Medium => tier.as_str().yellow(),
        RiskLevel::Low => tier.as_str().green(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max.saturating_sub(3)).collect::<String>())
    } else {
        text.to_string()
    }
}

fn push_row(out: &mut String, plain: &str, styled: &str) {
    let padding = WIDTH.saturating_sub(plain.chars().count());
    let _ = writeln!(
        out,
        "{}{}{}{}",
        "\u{2502}".red(),
        styled,
        " ".repeat(padding),
        "\u{2502}".red()
    );
}

fn push_separator(out: &mut String) {
    let _ = writeln!(
        out,
        "{}{}{}",
        "\u{251c}".red(),
        "\u{2500}".repeat(WIDTH).red().dimmed(),
        "\u{2524}".red()
    );
}

/// Render the boxed warning and prompt line.
#[must_use]
pub fn render_prompt(request: &ApprovalRequest, timeout: Duration, confirm_word: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}{}{}",
        "\u{256d}".red(),
        "\u{2500}".repeat(WIDTH).red(),
        "\u{256e}".red()
    );

    let command = truncate(&request.command_line, WIDTH - 16);
    let header = format!("  APPROVE: {command}");
    push_row(
        &mut out,
        &format!("{header}  [{}]", request.tier),
        &format!(
            "  {} {}  [{}]",
            "APPROVE:".white().bold(),
            command.white().bold(),
            tier_label(request.tier)
        ),
    );
    push_separator(&mut out);

    let reason = truncate(&format!("  Reason: {}", request.reason), WIDTH - 2);
    push_row(&mut out, &reason, &reason.bright_black().to_string());

    if let Some(analysis) = &request.analysis {
        let summary = truncate(
            &format!(
                "  Analysis ({}, {:.0}% confidence): {}",
                match analysis.source {
                    crate::analysis::AnalysisSource::Remote => "remote",
                    crate::analysis::AnalysisSource::Fallback => "local",
                },
                analysis.confidence * 100.0,
                analysis.explanation
            ),
            WIDTH - 2,
        );
        push_row(&mut out, &summary, &summary);
        for risk in &analysis.risks {
            let line = truncate(&format!("  ! {risk}"), WIDTH - 2);
            push_row(&mut out, &line, &line.yellow().to_string());
        }
        for alt in &analysis.alternatives {
            let line = truncate(&format!("  > {alt}"), WIDTH - 2);
            push_row(&mut out, &line, &line.cyan().to_string());
        }
    }
    push_separator(&mut out);

    let instruction = if request.tier == RiskLevel::Critical {
        format!("  To proceed, type: {confirm_word}")
    } else {
        "  Proceed? [y/N]".to_string()
    };
    push_row(&mut out, &instruction, &instruction.white().to_string());
    let remaining = format!("  ({} seconds to answer)", timeout.as_secs());
    push_row(&mut out, &remaining, &remaining.bright_black().to_string());

    let _ = writeln!(
        out,
        "{}{}{}",
        "\u{2570}".red(),
        "\u{2500}".repeat(WIDTH).red(),
        "\u{256f}".red()
    );
    let _ = write!(out, "{} ", ">".green().bold());
    out
}
