//! End-to-end interception flows over fake capabilities.
//!
//! Each test drives `Interceptor::intercept` or `Interceptor::redeem` and
//! checks both the outcome and what actually reached the executor.

mod common;

use async_trait::async_trait;
use common::{FixedBackend, HarnessBuilder, ScriptedTerminal, SwitchingPrincipal, ctx};
use shellgate::analysis::retry::RetryBackend;
use shellgate::analysis::{Analysis, AnalysisBackend, AnalysisRequest, AnalysisSource, RiskLevel, Verdict};
use shellgate::bypass::StdinKind;
use shellgate::error_codes::GateError;
use shellgate::orchestrator::{EXIT_BLOCKED, EXIT_DENIED, InterceptionOutcome};
use std::sync::{Arc, Mutex};

fn allow_everything() -> Analysis {
    Analysis {
        verdict: Verdict::Allow,
        risk_level: RiskLevel::Low,
        confidence: 0.99,
        explanation: "Looks fine.".to_string(),
        recommendation: String::new(),
        affected_resources: vec![],
        risks: vec![],
        alternatives: vec![],
        source: AnalysisSource::Remote,
    }
}

fn issued_code(outcome: &InterceptionOutcome) -> String {
    match outcome {
        InterceptionOutcome::Denied {
            auth_code: Some(code),
            ..
        } => code.clone(),
        other => panic!("expected an issued auth code, got {other:?}"),
    }
}

// Direct execution and bypass detection

#[tokio::test]
async fn safe_command_runs_without_consulting_the_classifier() {
    let backend = Arc::new(FixedBackend::returning(allow_everything()));
    let h = HarnessBuilder::new().backend(backend.clone()).build();

    let report = h.gate.intercept(ctx("ls", &["-la"])).await;

    assert_eq!(report.outcome, InterceptionOutcome::Executed { exit_code: 0 });
    assert_eq!(backend.calls(), 0);
    assert_eq!(h.recorder.programs(), ["ls"]);
}

#[tokio::test]
async fn piped_stdin_blocks_even_a_safe_command() {
    let h = HarnessBuilder::new().stdin(StdinKind::Pipe).build();

    let report = h.gate.intercept(ctx("ls", &[])).await;

    assert_eq!(report.outcome.exit_code(), EXIT_BLOCKED);
    let signal = report.bypass.expect("bypass signal is reported");
    assert!(signal.confidence > 0.8);
    assert!(h.recorder.programs().is_empty());
}

#[tokio::test]
async fn gate_control_variable_blocks() {
    let h = HarnessBuilder::new().build();
    let mut context = ctx("git", &["status"]);
    context.env.insert("SHELLGATE_BYPASS".into(), "1".into());

    let report = h.gate.intercept(context).await;

    match report.outcome {
        InterceptionOutcome::Blocked { reason, signal } => {
            assert!(reason.contains("SHELLGATE_BYPASS"), "{reason}");
            assert!(signal.is_some());
        }
        other => panic!("expected blocked, got {other:?}"),
    }
    assert!(h.recorder.programs().is_empty());
}

#[tokio::test]
async fn identity_change_between_sign_and_spawn_blocks() {
    let h = HarnessBuilder::new()
        .identity(Arc::new(SwitchingPrincipal::default()))
        .build();

    let report = h.gate.intercept(ctx("ls", &["-la"])).await;

    match report.outcome {
        InterceptionOutcome::Blocked { reason, .. } => assert!(reason.contains("uid"), "{reason}"),
        other => panic!("expected an integrity block, got {other:?}"),
    }
    assert!(h.recorder.programs().is_empty());
}

#[tokio::test]
async fn executed_child_gets_a_sanitized_environment() {
    let h = HarnessBuilder::new().build();
    let mut context = ctx("ls", &[]);
    context.env.insert("BASH_ENV".into(), "/tmp/evil.sh".into());
    context.env.insert("LD_LIBRARY_PATH".into(), "/tmp/libs".into());

    let report = h.gate.intercept(context).await;

    assert_eq!(report.outcome.label(), "executed");
    let request = h.recorder.last().expect("command was executed");
    assert!(!request.env.contains_key("BASH_ENV"));
    assert!(!request.env.contains_key("LD_LIBRARY_PATH"));
    assert_eq!(request.env.get("PATH").map(String::as_str), Some("/usr/bin:/bin"));
}

// Verdicts

#[tokio::test]
async fn catastrophic_command_denied_even_when_remote_allows() {
    let backend = Arc::new(FixedBackend::returning(allow_everything()));
    let h = HarnessBuilder::new().backend(backend.clone()).build();

    let report = h.gate.intercept(ctx("rm", &["-rf", "/"])).await;

    assert_eq!(report.outcome.exit_code(), EXIT_DENIED);
    assert!(report.outcome.reason().unwrap().starts_with("Blocked:"));
    assert_eq!(backend.calls(), 1);
    assert!(h.recorder.programs().is_empty());
}

#[tokio::test]
async fn read_only_name_with_executing_args_needs_approval() {
    for (command, argv) in [
        ("git", &["diff", "--output=/home/agent/.bashrc"][..]),
        ("git", &["diff", "--ext-diff"]),
        ("git", &["--config-env=core.pager=X", "log"]),
        ("sed", &["--expression=1e touch /tmp/owned", "/etc/hostname"]),
        ("sed", &["-f", "evil.sed", "/etc/hostname"]),
        ("tar", &["-tMf", "a.tar", "-F", "./evil.sh"]),
    ] {
        let h = HarnessBuilder::new().build();

        let report = h.gate.intercept(ctx(command, argv)).await;

        issued_code(&report.outcome);
        let analysis = report.analysis.expect("argv is analyzed");
        assert_eq!(analysis.verdict, Verdict::Warn, "{command} {argv:?}");
        assert!(h.recorder.programs().is_empty(), "{command} {argv:?}");
    }
}

#[tokio::test]
async fn retries_exhausted_still_yields_a_block_via_fallback() {
    let failing = Arc::new(FixedBackend::failing(GateError::analysis_transport(
        "connection refused",
    )));
    let retry = RetryBackend::new(failing.clone())
        .with_max_retries(2)
        .with_base_delay_ms(1)
        .with_max_delay_ms(5);
    let h = HarnessBuilder::new().backend(Arc::new(retry)).build();

    let report = h.gate.intercept(ctx("rm", &["-rf", "/"])).await;

    assert_eq!(failing.calls(), 3);
    assert!(matches!(
        report.outcome,
        InterceptionOutcome::Denied { auth_code: None, .. }
    ));
    let analysis = report.analysis.expect("fallback analysis is reported");
    assert_eq!(analysis.verdict, Verdict::Block);
    assert_eq!(analysis.source, AnalysisSource::Fallback);
}

/// Captures what the remote classifier was shown.
#[derive(Default)]
struct Capturing(Mutex<Vec<AnalysisRequest>>);

#[async_trait]
impl AnalysisBackend for Capturing {
    fn name(&self) -> &str {
        "capturing"
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, GateError> {
        self.0.lock().unwrap().push(request.clone());
        Ok(allow_everything())
    }
}

#[tokio::test]
async fn secrets_never_reach_the_remote_classifier() {
    let capturing = Arc::new(Capturing::default());
    let h = HarnessBuilder::new().backend(capturing.clone()).build();
    let secret = "sk-abcdefghijklmnopqrstuvwx";

    let report = h
        .gate
        .intercept(ctx(
            "curl",
            &["-H", &format!("Authorization: Bearer {secret}"), "https://api.example.com"],
        ))
        .await;

    let seen = capturing.0.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(!seen[0].command_line().contains(secret));
    assert!(!report.display.contains(secret));
    // The executed argv keeps the real value.
    let request = h.recorder.last().expect("allowed command ran");
    assert!(request.args[1].contains(secret));
}

// Approval on the terminal

#[tokio::test]
async fn warn_approved_on_terminal_executes() {
    let terminal = ScriptedTerminal::answering(&["y"]);
    let h = HarnessBuilder::new().terminal(Arc::new(terminal.clone())).build();

    let report = h.gate.intercept(ctx("git", &["push", "--force"])).await;

    assert_eq!(report.outcome, InterceptionOutcome::Executed { exit_code: 0 });
    assert!(report.approval.expect("approval recorded").approved);
    assert_eq!(terminal.prompts(), 1);
    assert!(terminal.transcript().contains("git push --force"));
    let request = h.recorder.last().expect("approved command ran");
    assert_eq!(request.program, "git");
    assert_eq!(request.args, ["push", "--force"]);
}

#[tokio::test]
async fn warn_declined_on_terminal_is_denied() {
    let terminal = ScriptedTerminal::answering(&["n"]);
    let h = HarnessBuilder::new().terminal(Arc::new(terminal)).build();

    let report = h.gate.intercept(ctx("git", &["reset", "--hard"])).await;

    assert_eq!(
        report.outcome.reason(),
        Some("Not approved: declined by user")
    );
    assert!(h.recorder.programs().is_empty());
}

#[tokio::test]
async fn unanswered_prompt_times_out_as_denial() {
    let h = HarnessBuilder::new()
        .terminal(Arc::new(ScriptedTerminal::answering(&[])))
        .build();

    let report = h.gate.intercept(ctx("git", &["push", "--force"])).await;

    assert_eq!(report.outcome.label(), "denied");
    assert!(report.outcome.reason().unwrap().contains("timed out"));
    assert!(h.recorder.programs().is_empty());
}

// Auth codes

#[tokio::test]
async fn code_issued_without_terminal_is_redeemed_once() {
    let agent = HarnessBuilder::new().build();
    let issued = agent.gate.intercept(ctx("git", &["push", "--force"])).await;
    let code = issued_code(&issued.outcome);
    assert!(agent.recorder.programs().is_empty());

    let human = HarnessBuilder::new()
        .store(agent.store.clone())
        .terminal(Arc::new(ScriptedTerminal::answering(&["y", "y"])))
        .build();

    let redeemed = human.gate.redeem(&code, ctx("shellgate", &[])).await;
    assert_eq!(redeemed.outcome, InterceptionOutcome::Executed { exit_code: 0 });
    let request = human.recorder.last().expect("redeemed command ran");
    assert_eq!(request.program, "git");
    assert_eq!(request.args, ["push", "--force"]);

    let again = human.gate.redeem(&code, ctx("shellgate", &[])).await;
    assert_eq!(
        again.outcome.reason(),
        Some("Auth code rejected: already_used")
    );
    assert_eq!(human.recorder.programs().len(), 1);
}

#[tokio::test]
async fn declined_redemption_burns_the_code() {
    let agent = HarnessBuilder::new().build();
    let code = issued_code(&agent.gate.intercept(ctx("git", &["push", "-f"])).await.outcome);

    let human = HarnessBuilder::new()
        .store(agent.store.clone())
        .terminal(Arc::new(ScriptedTerminal::answering(&["n", "y"])))
        .build();

    let declined = human.gate.redeem(&code, ctx("shellgate", &[])).await;
    assert_eq!(declined.outcome.label(), "denied");

    let retried = human.gate.redeem(&code, ctx("shellgate", &[])).await;
    assert_eq!(
        retried.outcome.reason(),
        Some("Auth code rejected: already_used")
    );
    assert!(human.recorder.programs().is_empty());
}

#[tokio::test]
async fn unknown_code_is_rejected() {
    let h = HarnessBuilder::new()
        .terminal(Arc::new(ScriptedTerminal::answering(&["y"])))
        .build();

    let report = h.gate.redeem("amber-falcon-42", ctx("shellgate", &[])).await;

    assert_eq!(report.outcome.reason(), Some("Auth code rejected: unknown"));
}

#[tokio::test]
async fn redemption_from_a_pipe_is_blocked() {
    let agent = HarnessBuilder::new().build();
    let code = issued_code(&agent.gate.intercept(ctx("git", &["push", "-f"])).await.outcome);

    let scripted = HarnessBuilder::new()
        .store(agent.store.clone())
        .stdin(StdinKind::Pipe)
        .terminal(Arc::new(ScriptedTerminal::answering(&["y"])))
        .build();

    let report = scripted.gate.redeem(&code, ctx("shellgate", &[])).await;
    assert_eq!(report.outcome.exit_code(), EXIT_BLOCKED);
    assert!(scripted.recorder.programs().is_empty());
}

// Builtins

#[tokio::test]
async fn builtin_runs_through_the_shell_with_literal_args() {
    let h = HarnessBuilder::new().build();

    let report = h.gate.intercept(ctx("cd", &["/tmp/my project"])).await;

    assert_eq!(report.outcome.label(), "executed");
    assert!(report.analysis.is_none());
    let request = h.recorder.last().expect("builtin ran");
    assert_eq!(request.program, "sh");
    assert_eq!(request.args[0], "-c");
    assert_eq!(request.args.last().map(String::as_str), Some("/tmp/my project"));
}

#[tokio::test]
async fn builtin_with_chained_args_loses_the_shortcut() {
    let h = HarnessBuilder::new().build();

    let report = h.gate.intercept(ctx("cd", &["/tmp; rm -rf ~"])).await;

    let route = report.route.expect("route reported");
    assert!(!route.is_builtin);
    assert!(route.requires_approval);
    // No terminal: the chained line needs a human, so it is not run here.
    assert_eq!(report.outcome.exit_code(), EXIT_DENIED);
    assert!(h.recorder.programs().is_empty());
}

#[tokio::test]
async fn export_of_a_gate_variable_is_refused() {
    let h = HarnessBuilder::new().build();

    let report = h.gate.intercept(ctx("export", &["LD_PRELOAD=/tmp/hook.so"])).await;

    assert_eq!(report.outcome.exit_code(), EXIT_DENIED);
    assert!(h.recorder.programs().is_empty());
}
