//! Process execution boundary.
//!
//! Commands run with a literal argument vector, inherited standard streams,
//! the context's working directory, and an environment rebuilt from the
//! context snapshot with gate-control and injection variables removed.

use crate::bypass::LIBRARY_INJECTION;
use crate::config::ENV_PREFIX;
use crate::error_codes::GateError;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

/// Startup-file variables that make a shell source arbitrary code.
const STARTUP_INJECTION: &[&str] = &["BASH_ENV", "ENV"];

/// Loader search paths; a child could resolve its libraries from them.
const LOADER_SEARCH_PATHS: &[&str] = &["LD_LIBRARY_PATH"];

/// True when `key` must never reach a child process.
#[must_use]
pub fn is_stripped(key: &str) -> bool {
    key.strip_prefix(ENV_PREFIX)
        .is_some_and(|rest| rest.starts_with('_'))
        || key.starts_with("DYLD_")
        || LIBRARY_INJECTION.contains(&key)
        || STARTUP_INJECTION.contains(&key)
        || LOADER_SEARCH_PATHS.contains(&key)
}

/// Copy of `env` without any stripped variable.
#[must_use]
pub fn sanitized_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(key, _)| !is_stripped(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Everything needed to start one child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Already sanitized.
    pub env: BTreeMap<String, String>,
}

impl ExecRequest {
    /// Build from raw parts, sanitizing `env`.
    #[must_use]
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: cwd.to_path_buf(),
            env: sanitized_env(env),
        }
    }
}

/// Runs a child process to completion and reports its exit code.
pub trait Executor: Send + Sync {
    fn execute(&self, request: &ExecRequest) -> Result<i32, GateError>;
}

/// Spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl Executor for ProcessExecutor {
    fn execute(&self, request: &ExecRequest) -> Result<i32, GateError> {
        tracing::debug!(
            program = %request.program,
            argc = request.args.len(),
            cwd = %request.cwd.display(),
            "spawning child"
        );
        let status = Command::new(&request.program)
            .args(&request.args)
            .current_dir(&request.cwd)
            .env_clear()
            .envs(&request.env)
            .status()
            .map_err(|e| spawn_error(&request.program, &e))?;
        Ok(exit_code(status))
    }
}

fn spawn_error(program: &str, err: &io::Error) -> GateError {
    match err.kind() {
        io::ErrorKind::NotFound => GateError::command_not_found(program),
        _ => GateError::spawn_failed(program, &err.to_string()),
    }
}

/// Child exit code, or `128 + signo` when it was killed by a signal.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
