//! Shell builtin handler.
//!
//! Builtins have no executable of their own, so they run through `sh -c`.
//! The script is fixed (`"$0" "$@"`) and the builtin plus its arguments are
//! passed as positional parameters, so no argument is ever parsed as shell
//! code. Builtins that set or clear variables are refused when the variable
//! controls the gate or the dynamic loader.

use crate::error_codes::{ErrorCode, GateError};
use crate::exec::ExecRequest;
use crate::shell::base_name;
use std::collections::BTreeMap;
use std::path::Path;

/// Interpreter that hosts builtins.
pub const BUILTIN_SHELL: &str = "sh";

/// Runs `$0` with the remaining positional parameters.
const POSITIONAL_SCRIPT: &str = "\"$0\" \"$@\"";

/// Builtins that assign or remove variables.
const VARIABLE_BUILTINS: &[&str] = &["export", "unset", "declare", "typeset", "readonly", "local"];

const GUARDED_PREFIXES: &[&str] = &["SHELLGATE_", "LD_", "DYLD_"];
const GUARDED_NAMES: &[&str] = &["BASH_ENV", "ENV", "PROMPT_COMMAND"];

/// True when builtins may not touch `name`.
#[must_use]
pub fn is_guarded(name: &str) -> bool {
    GUARDED_NAMES.contains(&name) || GUARDED_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// First guarded variable that `builtin args` would assign or unset.
#[must_use]
pub fn guarded_target(builtin: &str, args: &[String]) -> Option<String> {
    if !VARIABLE_BUILTINS.contains(&base_name(builtin)) {
        return None;
    }
    args.iter()
        .filter(|arg| !arg.starts_with('-') && !arg.starts_with('+'))
        .map(|arg| arg.split_once('=').map_or(arg.as_str(), |(name, _)| name))
        .find(|name| is_guarded(name))
        .map(str::to_string)
}

/// Build the `sh -c` invocation for a builtin, or refuse it.
pub fn prepare(
    builtin: &str,
    args: &[String],
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> Result<ExecRequest, GateError> {
    if let Some(name) = guarded_target(builtin, args) {
        crate::security_event!(
            "guarded_variable",
            builtin = base_name(builtin),
            variable = name.as_str()
        );
        return Err(GateError::new(
            ErrorCode::GuardedVariable,
            format!("'{}' may not modify {name}", base_name(builtin)),
        )
        .add_context("variable", name));
    }

    let mut sh_args = Vec::with_capacity(args.len() + 2);
    sh_args.push("-c".to_string());
    sh_args.push(POSITIONAL_SCRIPT.to_string());
    sh_args.push(base_name(builtin).to_string());
    sh_args.extend(args.iter().cloned());
    Ok(ExecRequest::new(BUILTIN_SHELL, sh_args, cwd, env))
}
