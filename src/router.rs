//! Static command routing.
//!
//! [`Router::route`] is pure and synchronous: the same command, arguments, and
//! context always produce the same [`RoutingDecision`]. Checks run from most
//! to least restrictive and the first match wins:
//!
//! 1. privilege escalation (explicit or inferred from the context)
//! 2. the always-dangerous table, argument-independent
//! 3. shell metacharacters or code-executing builtins (chains)
//! 4. interpreter builtins
//! 5. the argument-aware safe tables
//! 6. everything else is unknown and never safe by default

use crate::config::{Config, Enforcement};
use crate::context::InterceptionContext;
use crate::fastpath::read_only_args_ok;
use crate::shell::{
    ALWAYS_DANGEROUS, ALWAYS_SAFE, BUILTINS, CODE_EXECUTING_BUILTINS, PRIVILEGE_ESCALATION,
    READ_ONLY, arg_has_metacharacters, base_name, has_metacharacters, is_mkfs_variant,
};
use serde::Serialize;
use std::fmt;

/// Classification reported with every routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTag {
    Safe,
    Dangerous,
    Builtin,
    Chain,
    Sudo,
    Unknown,
}

impl fmt::Display for RouteTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Safe => "safe",
            Self::Dangerous => "dangerous",
            Self::Builtin => "builtin",
            Self::Chain => "chain",
            Self::Sudo => "sudo",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    /// Execute immediately without analysis or approval.
    pub direct: bool,
    pub requires_analysis: bool,
    pub requires_approval: bool,
    pub is_builtin: bool,
    /// Arguments carry shell syntax. Execution still passes them as literal argv.
    pub requires_shell: bool,
    #[serde(rename = "routed")]
    pub tag: RouteTag,
    pub reason: String,
}

impl RoutingDecision {
    fn gated(tag: RouteTag, requires_shell: bool, reason: String) -> Self {
        Self {
            direct: false,
            requires_analysis: true,
            requires_approval: true,
            is_builtin: false,
            requires_shell,
            tag,
            reason,
        }
    }
}

/// Router with the built-in tables plus configured extensions.
#[derive(Debug, Clone, Default)]
pub struct Router {
    extra_safe: Vec<String>,
    extra_dangerous: Vec<String>,
    enforcement: Enforcement,
}

impl Router {
    #[must_use]
    pub fn new(enforcement: Enforcement) -> Self {
        Self {
            enforcement,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            extra_safe: config.lists.safe.clone(),
            extra_dangerous: config.lists.dangerous.clone(),
            enforcement: config.general.enforcement,
        }
    }

    fn is_dangerous(&self, base: &str) -> bool {
        ALWAYS_DANGEROUS.contains(&base)
            || is_mkfs_variant(base)
            || self.extra_dangerous.iter().any(|d| d == base)
    }

    fn is_safe(&self, base: &str, args: &[String]) -> bool {
        if self.extra_dangerous.iter().any(|d| d == base) {
            return false;
        }
        ALWAYS_SAFE.contains(&base)
            || self.extra_safe.iter().any(|s| s == base)
            || (READ_ONLY.contains(&base) && read_only_args_ok(base, args))
    }

    /// Classify `command args` under `ctx`.
    #[must_use]
    pub fn route(
        &self,
        command: &str,
        args: &[String],
        ctx: &InterceptionContext,
    ) -> RoutingDecision {
        let base = base_name(command);
        let has_meta = has_metacharacters(args) || arg_has_metacharacters(command);

        if PRIVILEGE_ESCALATION.contains(&base) {
            return RoutingDecision::gated(
                RouteTag::Sudo,
                has_meta,
                format!("'{base}' escalates privileges"),
            );
        }
        if ctx.is_sudo {
            return RoutingDecision::gated(
                RouteTag::Sudo,
                has_meta,
                "running with elevated privileges".to_string(),
            );
        }

        if self.is_dangerous(base) {
            return RoutingDecision::gated(
                RouteTag::Dangerous,
                has_meta,
                format!("'{base}' is always dangerous"),
            );
        }

        if has_meta {
            return RoutingDecision::gated(
                RouteTag::Chain,
                true,
                "arguments contain shell metacharacters".to_string(),
            );
        }
        if CODE_EXECUTING_BUILTINS.contains(&base) {
            return RoutingDecision::gated(
                RouteTag::Chain,
                true,
                format!("'{base}' executes arbitrary shell code"),
            );
        }

        if BUILTINS.contains(&base) {
            return RoutingDecision {
                direct: false,
                requires_analysis: false,
                requires_approval: false,
                is_builtin: true,
                requires_shell: false,
                tag: RouteTag::Builtin,
                reason: format!("'{base}' is a shell builtin"),
            };
        }

        if self.is_safe(base, args) {
            return RoutingDecision {
                direct: true,
                requires_analysis: false,
                requires_approval: false,
                is_builtin: false,
                requires_shell: false,
                tag: RouteTag::Safe,
                reason: format!("'{base}' is read-only with these arguments"),
            };
        }

        RoutingDecision {
            direct: false,
            requires_analysis: true,
            requires_approval: self.enforcement == Enforcement::Strict,
            is_builtin: false,
            requires_shell: false,
            tag: RouteTag::Unknown,
            reason: format!("'{base}' is not classified"),
        }
    }
}

/// Route with the built-in tables and standard enforcement.
#[must_use]
pub fn route(command: &str, args: &[String], ctx: &InterceptionContext) -> RoutingDecision {
    Router::default().route(command, args, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    fn ctx() -> InterceptionContext {
        InterceptionContext::builder("x", vec![]).build()
    }

    #[test]
    fn rm_rf_root_is_dangerous() {
        let d = route("rm", &args(&["-rf", "/"]), &ctx());
        assert!(!d.direct);
        assert!(d.requires_approval);
        assert_eq!(d.tag, RouteTag::Dangerous);
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["routed"], "dangerous");
        assert_eq!(json["requiresApproval"], true);
    }

    #[test]
    fn path_qualified_commands_use_basename() {
        assert_eq!(route("/bin/rm", &args(&["x"]), &ctx()).tag, RouteTag::Dangerous);
        assert_eq!(route("/usr/bin/ls", &[], &ctx()).tag, RouteTag::Safe);
        assert_eq!(route("/sbin/mkfs.ext4", &args(&["/dev/sdb"]), &ctx()).tag, RouteTag::Dangerous);
    }

    #[test]
    fn sudo_explicit_and_inferred() {
        assert_eq!(route("sudo", &args(&["ls"]), &ctx()).tag, RouteTag::Sudo);
        let elevated = InterceptionContext::builder("ls", vec![]).sudo(true).build();
        let d = route("ls", &[], &elevated);
        assert_eq!(d.tag, RouteTag::Sudo);
        assert!(d.requires_approval);
    }

    #[test]
    fn metacharacters_make_a_chain() {
        let d = route("ls", &args(&["-la", "&&", "rm", "-rf", "/"]), &ctx());
        assert_eq!(d.tag, RouteTag::Chain);
        assert!(d.requires_shell);
        assert!(d.requires_approval);
        assert!(d.requires_analysis);
    }

    #[test]
    fn dangerous_outranks_chain() {
        let d = route("rm", &args(&["-rf", "*"]), &ctx());
        assert_eq!(d.tag, RouteTag::Dangerous);
        assert!(d.requires_shell);
    }

    #[test]
    fn code_executing_builtins_are_chains() {
        for cmd in ["eval", "source", ".", "exec"] {
            let d = route(cmd, &args(&["x"]), &ctx());
            assert_eq!(d.tag, RouteTag::Chain, "{cmd}");
            assert!(!d.is_builtin);
        }
    }

    #[test]
    fn builtins_route_to_handler() {
        let d = route("cd", &args(&["/tmp"]), &ctx());
        assert_eq!(d.tag, RouteTag::Builtin);
        assert!(d.is_builtin);
        assert!(!d.direct);
    }

    #[test]
    fn safe_table_is_argument_aware() {
        assert!(route("find", &args(&[".", "-name", "x"]), &ctx()).direct);
        assert_eq!(
            route("find", &args(&[".", "-delete"]), &ctx()).tag,
            RouteTag::Unknown
        );
        assert!(route("git", &args(&["status"]), &ctx()).direct);
        assert_eq!(
            route("git", &args(&["push", "--force"]), &ctx()).tag,
            RouteTag::Unknown
        );
    }

    #[test]
    fn unknown_depends_on_enforcement() {
        let standard = Router::new(Enforcement::Standard).route("curl", &args(&["x"]), &ctx());
        assert_eq!(standard.tag, RouteTag::Unknown);
        assert!(standard.requires_analysis);
        assert!(!standard.requires_approval);
        assert!(!standard.direct);

        let strict = Router::new(Enforcement::Strict).route("curl", &args(&["x"]), &ctx());
        assert!(strict.requires_approval);
    }

    #[test]
    fn configured_lists_extend_tables() {
        let mut config = Config::default();
        config.lists.dangerous.push("terraform".into());
        config.lists.safe.push("cargo-tree".into());
        config.lists.dangerous.push("tree".into());
        let router = Router::from_config(&config);
        assert_eq!(router.route("terraform", &[], &ctx()).tag, RouteTag::Dangerous);
        assert_eq!(router.route("cargo-tree", &[], &ctx()).tag, RouteTag::Safe);
        assert_eq!(router.route("tree", &[], &ctx()).tag, RouteTag::Dangerous);
    }
}
