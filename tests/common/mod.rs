//! Shared fakes for the integration tests.
//!
//! Each fake stands in for one capability the interceptor takes from the
//! outside world: the process tree, stdin, the controlling terminal, the
//! remote classifier, process identity, and the executor.

#![allow(dead_code)]

use async_trait::async_trait;
use shellgate::analysis::{Analysis, AnalysisBackend, AnalysisRequest};
use shellgate::auth_codes::MemoryAuthStore;
use shellgate::bypass::{BypassDetector, FixedStdin, ProcessInfo, ProcessTreeProvider, StdinKind};
use shellgate::config::Config;
use shellgate::context::InterceptionContext;
use shellgate::error_codes::GateError;
use shellgate::exec::{ExecRequest, Executor};
use shellgate::integrity::{IdentityProbe, Principal};
use shellgate::orchestrator::Interceptor;
use shellgate::terminal::{ReadOutcome, TerminalChannel, TerminalProvider};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Process tree with no visible ancestors.
pub struct EmptyTree;

impl ProcessTreeProvider for EmptyTree {
    fn process(&self, _pid: u32) -> Option<ProcessInfo> {
        None
    }
}

/// Terminal that answers prompts from a script and keeps a transcript.
#[derive(Clone, Default)]
pub struct ScriptedTerminal {
    answers: Arc<Mutex<VecDeque<String>>>,
    transcript: Arc<Mutex<String>>,
    opened: Arc<AtomicU32>,
}

impl ScriptedTerminal {
    pub fn answering(answers: &[&str]) -> Self {
        let terminal = Self::default();
        terminal
            .answers
            .lock()
            .unwrap()
            .extend(answers.iter().map(|a| (*a).to_string()));
        terminal
    }

    pub fn transcript(&self) -> String {
        self.transcript.lock().unwrap().clone()
    }

    /// How many times a prompt was opened.
    pub fn prompts(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }
}

struct ScriptedChannel(ScriptedTerminal);

impl TerminalChannel for ScriptedChannel {
    fn flush_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn write_text(&mut self, text: &str) -> io::Result<()> {
        self.0.transcript.lock().unwrap().push_str(text);
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration, _cancel: &AtomicBool) -> io::Result<ReadOutcome> {
        Ok(match self.0.answers.lock().unwrap().pop_front() {
            Some(line) => ReadOutcome::Line(line),
            None => ReadOutcome::TimedOut,
        })
    }
}

impl TerminalProvider for ScriptedTerminal {
    fn open(&self) -> Result<Box<dyn TerminalChannel>, GateError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedChannel(self.clone())))
    }

    fn available(&self) -> bool {
        true
    }
}

/// Executor that records requests instead of spawning.
#[derive(Default)]
pub struct Recorder {
    pub requests: Mutex<Vec<ExecRequest>>,
}

impl Recorder {
    pub fn programs(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.program.clone())
            .collect()
    }

    pub fn last(&self) -> Option<ExecRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

impl Executor for Recorder {
    fn execute(&self, request: &ExecRequest) -> Result<i32, GateError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(0)
    }
}

/// Remote classifier that always returns the same thing.
pub struct FixedBackend {
    pub result: Result<Analysis, GateError>,
    pub calls: AtomicU32,
}

impl FixedBackend {
    pub fn returning(analysis: Analysis) -> Self {
        Self {
            result: Ok(analysis),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(err: GateError) -> Self {
        Self {
            result: Err(err),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisBackend for FixedBackend {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn analyze(&self, _request: &AnalysisRequest) -> Result<Analysis, GateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

pub fn env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("PATH".to_string(), "/usr/bin:/bin".to_string()),
        ("HOME".to_string(), "/home/agent".to_string()),
    ])
}

pub fn ctx(command: &str, args: &[&str]) -> InterceptionContext {
    InterceptionContext::builder(command, args.iter().map(|s| (*s).to_string()).collect())
        .env(env())
        .cwd(std::env::temp_dir())
        .user("agent")
        .parent_pid(None)
        .build()
}

/// Config with the human-speed floor disabled, since scripted answers
/// arrive instantly.
pub fn config() -> Config {
    let mut config = Config::default();
    config.approval.min_response_ms = 0;
    config
}

/// Everything a test needs to drive and inspect one interceptor.
/// Principal that changes uid after its first capture, as if the gate
/// process had switched users between signing and spawning.
#[derive(Default)]
pub struct SwitchingPrincipal {
    captures: AtomicU32,
}

impl IdentityProbe for SwitchingPrincipal {
    fn capture(&self) -> Result<Principal, GateError> {
        let first = self.captures.fetch_add(1, Ordering::SeqCst) == 0;
        Ok(Principal {
            pid: 4242,
            uid: if first { 1000 } else { 0 },
        })
    }
}

pub struct Harness {
    pub gate: Interceptor,
    pub recorder: Arc<Recorder>,
    pub store: Arc<MemoryAuthStore>,
}

pub struct HarnessBuilder {
    config: Config,
    stdin: StdinKind,
    terminal: Option<Arc<dyn TerminalProvider>>,
    backend: Option<Arc<dyn AnalysisBackend>>,
    store: Arc<MemoryAuthStore>,
    identity: Option<Arc<dyn IdentityProbe>>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: config(),
            stdin: StdinKind::Terminal,
            terminal: None,
            backend: None,
            store: Arc::new(MemoryAuthStore::new()),
            identity: None,
        }
    }

    pub fn stdin(mut self, stdin: StdinKind) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn terminal(mut self, terminal: Arc<dyn TerminalProvider>) -> Self {
        self.terminal = Some(terminal);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn AnalysisBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Share an auth-code store between harnesses, as separate processes
    /// share the store file.
    pub fn store(mut self, store: Arc<MemoryAuthStore>) -> Self {
        self.store = store;
        self
    }

    pub fn identity(mut self, probe: Arc<dyn IdentityProbe>) -> Self {
        self.identity = Some(probe);
        self
    }

    pub fn build(self) -> Harness {
        let recorder = Arc::new(Recorder::default());
        let detector = BypassDetector::new(
            Arc::new(EmptyTree),
            Arc::new(FixedStdin(self.stdin)),
            &env(),
            &self.config.bypass,
        );
        let terminal = self
            .terminal
            .unwrap_or_else(|| Arc::new(shellgate::terminal::NoTerminal));
        let mut builder = Interceptor::builder(self.config);
        if let Some(probe) = self.identity {
            builder = builder.identity_probe(probe);
        }
        let gate = builder
            .bypass_detector(Arc::new(detector))
            .analysis_backend(self.backend)
            .terminal(terminal)
            .auth_store(self.store.clone())
            .executor(recorder.clone())
            .build()
            .expect("interceptor should build");
        Harness {
            gate,
            recorder,
            store: self.store,
        }
    }
}
