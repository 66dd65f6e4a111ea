//! Per-invocation interception context.
//!
//! An [`InterceptionContext`] is built once at the start of an interception and
//! never mutated afterwards. Every component reads from the same snapshot so a
//! caller cannot change the environment between two checks.

use crate::error_codes::{ErrorCode, GateError};
use crate::shell::{PRIVILEGE_ESCALATION, base_name};
use crate::sys;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;

/// Environment variables that indicate we are running under a privilege
/// escalation wrapper.
const SUDO_MARKERS: &[&str] = &["SUDO_USER", "SUDO_COMMAND", "SUDO_UID", "DOAS_USER"];

/// Immutable snapshot of one command invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InterceptionContext {
    pub command: String,
    pub args: Vec<String>,
    /// Environment snapshot taken when the context was built.
    #[serde(skip)]
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub user: String,
    pub timestamp: DateTime<Utc>,
    pub is_sudo: bool,
    pub terminal: Option<String>,
    pub parent_pid: Option<u32>,
}

impl InterceptionContext {
    /// Start a builder for the given command.
    #[must_use]
    pub fn builder(command: impl Into<String>, args: Vec<String>) -> ContextBuilder {
        ContextBuilder {
            command: command.into(),
            args,
            env: None,
            cwd: None,
            user: None,
            timestamp: None,
            is_sudo: None,
            terminal: None,
            parent_pid: None,
        }
    }

    /// Capture the live process state for `command`.
    pub fn capture(command: impl Into<String>, args: Vec<String>) -> Result<Self, GateError> {
        Self::builder(command, args).capture()
    }

    /// Basename of the command (`/bin/rm` → `rm`).
    #[must_use]
    pub fn base_command(&self) -> &str {
        base_name(&self.command)
    }

    /// Look up an environment variable in the snapshot.
    #[must_use]
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// The full command line for display and logging (not for execution).
    #[must_use]
    pub fn command_line(&self) -> String {
        crate::shell::display_line(&self.command, &self.args)
    }
}

/// Builder for [`InterceptionContext`]; unset fields are captured from the
/// live process by [`ContextBuilder::capture`] or defaulted by
/// [`ContextBuilder::build`].
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    command: String,
    args: Vec<String>,
    env: Option<BTreeMap<String, String>>,
    cwd: Option<PathBuf>,
    user: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    is_sudo: Option<bool>,
    terminal: Option<Option<String>>,
    parent_pid: Option<Option<u32>>,
}

impl ContextBuilder {
    #[must_use]
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    #[must_use]
    pub fn env_var(mut self, key: &str, value: &str) -> Self {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn sudo(mut self, is_sudo: bool) -> Self {
        self.is_sudo = Some(is_sudo);
        self
    }

    #[must_use]
    pub fn terminal(mut self, terminal: Option<String>) -> Self {
        self.terminal = Some(terminal);
        self
    }

    #[must_use]
    pub fn parent_pid(mut self, pid: Option<u32>) -> Self {
        self.parent_pid = Some(pid);
        self
    }

    /// Fill every unset field from the running process.
    pub fn capture(mut self) -> Result<InterceptionContext, GateError> {
        if self.env.is_none() {
            self.env = Some(std::env::vars().collect());
        }
        if self.cwd.is_none() {
            let cwd = std::env::current_dir().map_err(|e| {
                GateError::new(
                    ErrorCode::WorkingDirUnavailable,
                    format!("Cannot determine working directory: {e}"),
                )
            })?;
            self.cwd = Some(cwd);
        }
        if self.terminal.is_none() {
            self.terminal = Some(current_terminal_name());
        }
        if self.parent_pid.is_none() {
            self.parent_pid = Some(sys::parent_pid());
        }
        let euid_root = sys::euid() == 0;
        let mut ctx = self.build();
        if euid_root {
            ctx.is_sudo = true;
        }
        Ok(ctx)
    }

    /// Build with defaults for unset fields (empty env, `/` cwd).
    #[must_use]
    pub fn build(self) -> InterceptionContext {
        let env = self.env.unwrap_or_default();
        let user = self.user.unwrap_or_else(|| {
            env.get("USER")
                .or_else(|| env.get("LOGNAME"))
                .cloned()
                .unwrap_or_else(|| format!("uid:{}", sys::uid()))
        });
        let inferred_sudo = PRIVILEGE_ESCALATION.contains(&base_name(&self.command))
            || SUDO_MARKERS.iter().any(|key| env.contains_key(*key));
        InterceptionContext {
            command: self.command,
            args: self.args,
            cwd: self.cwd.unwrap_or_else(|| PathBuf::from("/")),
            user,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            is_sudo: self.is_sudo.unwrap_or(false) || inferred_sudo,
            terminal: self.terminal.unwrap_or(None),
            parent_pid: self.parent_pid.unwrap_or(None),
            env,
        }
    }
}

/// Name of the terminal attached to stdin, if any.
fn current_terminal_name() -> Option<String> {
    if !std::io::stdin().is_terminal() {
        return None;
    }
    std::fs::read_link("/proc/self/fd/0")
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|| std::env::var("TTY").ok())
        .or_else(|| Some("tty".to_string()))
}
