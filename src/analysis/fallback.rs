//! Local pattern classifier.
//!
//! Used whenever the remote collaborator is unavailable, and always run
//! alongside it so that a catastrophic command is blocked even if the remote
//! side says otherwise. It matches on the command line with the command's
//! basename substituted, so `/bin/rm -rf /` and `rm -rf /` look the same.

use super::{Analysis, AnalysisSource, RiskLevel, Verdict};
use crate::fastpath::read_only_args_ok;
use crate::shell::{
    ALWAYS_DANGEROUS, ALWAYS_SAFE, READ_ONLY, base_name, has_shell_operator, is_mkfs_variant,
};
use regex::Regex;
use std::sync::LazyLock;

struct RiskPattern {
    regex: Regex,
    name: &'static str,
    reason: &'static str,
    alternative: Option<&'static str>,
}

macro_rules! risk {
    ($name:literal, $re:literal, $reason:literal) => {
        RiskPattern {
            regex: Regex::new($re).expect(concat!("risk pattern '", $name, "' should compile")),
            name: $name,
            reason: $reason,
            alternative: None,
        }
    };
    ($name:literal, $re:literal, $reason:literal, $alt:literal) => {
        RiskPattern {
            regex: Regex::new($re).expect(concat!("risk pattern '", $name, "' should compile")),
            name: $name,
            reason: $reason,
            alternative: Some($alt),
        }
    };
}

/// Irreversible, system-wide damage. Always BLOCK.
static CATASTROPHIC: LazyLock<Vec<RiskPattern>> = LazyLock::new(|| {
    vec![
        risk!(
            "rm-recursive-root",
            r"^rm\s+(?:-\S+\s+)*(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)\s+(?:-\S+\s+)*(?:/|/\*|~/?|~/\*|\$HOME/?|\$\{HOME\}/?|\*)(?:\s|$)",
            "Recursive delete of the root, home, or wildcard target destroys the system or every user file."
        ),
        risk!(
            "fork-bomb",
            r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
            "Fork bomb exhausts the process table and hangs the machine."
        ),
        risk!(
            "mkfs-device",
            r"^mkfs(?:\.\w+)?\s+(?:\S+\s+)*/dev/",
            "Creating a filesystem on a device erases everything on it."
        ),
        risk!(
            "dd-to-device",
            r"^dd\s+(?:\S+\s+)*of=/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk|rdisk|md|mapper)",
            "dd onto a block device overwrites it without confirmation."
        ),
        risk!(
            "raw-disk-write",
            r">\s*/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk|rdisk)",
            "Redirecting output onto a raw disk corrupts its contents."
        ),
        risk!(
            "wipe-device",
            r"^(?:shred|wipefs)\s+(?:\S+\s+)*/dev/",
            "Wiping a device destroys its partition table or data."
        ),
        risk!(
            "chmod-777-root",
            r"^chmod\s+(?:\S+\s+)*-[a-zA-Z]*R[a-zA-Z]*\s+(?:\S+\s+)*0?777\s+/(?:\s|$)",
            "Recursively making / world-writable breaks system security."
        ),
        risk!(
            "pipe-to-shell",
            r"\b(?:curl|wget|fetch)\b[^|]*\|\s*(?:sudo\s+)?(?:ba|z|da|k|fi)?sh\b",
            "Piping a download straight into a shell executes unreviewed remote code.",
            "Download the script to a file, read it, then run it."
        ),
    ]
});

/// Destructive but sometimes intended. WARN so a human decides.
static RISKY: LazyLock<Vec<RiskPattern>> = LazyLock::new(|| {
    vec![
        risk!(
            "rm-recursive",
            r"^rm\s+(?:\S+\s+)*(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)(?:\s|$)",
            "Recursive delete removes whole directory trees permanently.",
            "List the target first with 'ls -R' or move it to a trash directory."
        ),
        risk!(
            "git-push-force",
            r"^git\s+push\s+(?:\S+\s+)*(?:--force|-f)(?:\s|$)",
            "Force push can destroy remote history.",
            "Use 'git push --force-with-lease'."
        ),
        risk!(
            "git-reset-hard",
            r"^git\s+reset\s+(?:\S+\s+)*--hard(?:\s|$)",
            "git reset --hard destroys uncommitted changes.",
            "Run 'git stash' first."
        ),
        risk!(
            "git-clean-force",
            r"^git\s+clean\s+(?:\S+\s+)*-[a-zA-Z]*f",
            "git clean -f removes untracked files permanently.",
            "Preview with 'git clean -n'."
        ),
        risk!(
            "git-branch-force-delete",
            r"^git\s+branch\s+(?:\S+\s+)*-D(?:\s|$)",
            "git branch -D deletes without a merge check.",
            "Use 'git branch -d'."
        ),
        risk!(
            "git-stash-drop",
            r"^git\s+stash\s+(?:drop|clear)(?:\s|$)",
            "Dropping stashes deletes saved work permanently.",
            "Inspect with 'git stash list' first."
        ),
        risk!(
            "kubectl-delete",
            r"^kubectl\s+(?:\S+\s+)*(?:delete|exec)(?:\s|$)",
            "kubectl delete/exec changes live cluster state."
        ),
        risk!(
            "terraform-destroy",
            r"^terraform\s+(?:\S+\s+)*destroy(?:\s|$)",
            "terraform destroy tears down managed infrastructure.",
            "Review with 'terraform plan -destroy'."
        ),
        risk!(
            "docker-prune",
            r"^docker\s+(?:system\s+prune|rmi?\s)",
            "Removing containers or images loses their state."
        ),
        risk!(
            "sql-destructive",
            r"(?i)\b(?:drop\s+(?:table|database|schema|index)|truncate\s+(?:table\s+)?\w|delete\s+from)\b",
            "Destructive SQL statement.",
            "Take a backup or run inside a transaction first."
        ),
        risk!(
            "kill-force",
            r"^(?:kill\s+(?:\S+\s+)*-(?:9|KILL|SIGKILL)(?:\s|$)|killall\s|pkill\s)",
            "Force-killing processes skips their cleanup."
        ),
        risk!(
            "systemctl-stop",
            r"^systemctl\s+(?:\S+\s+)*(?:stop|disable|mask)(?:\s|$)",
            "Stopping or disabling services affects the whole system."
        ),
        risk!(
            "cloud-delete",
            r"^aws\s+(?:s3\s+(?:rm|rb)|ec2\s+terminate-instances)(?:\s|$)",
            "Deletes cloud resources."
        ),
        risk!(
            "privilege-escalation",
            r"^(?:sudo|su|doas|pkexec)(?:\s|$)",
            "Runs with elevated privileges."
        ),
        risk!(
            "chmod-broad",
            r"^chmod\s+(?:\S+\s+)*(?:-[a-zA-Z]*R|0?777)(?:\s|$)",
            "Broad permission change."
        ),
        risk!(
            "device-write",
            r">\s*/dev/\S",
            "Writes to a device file."
        ),
    ]
});

/// Commands or command prefixes that only read state.
const SAFE_PREFIXES: &[&str] = &[
    "ls", "pwd", "echo", "cat", "head", "tail", "wc", "which", "whoami", "date", "cal",
    "uptime", "hostname", "uname", "cd", "pushd", "popd", "dirs", "git status", "git log",
    "git diff", "git branch", "git show", "npm list", "npm outdated", "npm --version",
    "node --version", "python --version", "python3 --version", "pip list", "pip show",
    "pgrep", "ps aux", "htop",
];

/// Classify `command args` without any I/O.
#[must_use]
pub fn classify(command: &str, args: &[String]) -> Analysis {
    let base = base_name(command);
    let mut line = String::from(base);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    classify_line(&line)
}

/// Classify a full command line.
#[must_use]
pub fn classify_line(line: &str) -> Analysis {
    let line = line.trim();

    let catastrophic: Vec<&RiskPattern> =
        CATASTROPHIC.iter().filter(|p| p.regex.is_match(line)).collect();
    if let Some(first) = catastrophic.first() {
        return Analysis {
            verdict: Verdict::Block,
            risk_level: RiskLevel::Critical,
            confidence: 0.95,
            explanation: first.reason.to_string(),
            recommendation: "Do not run this command.".to_string(),
            affected_resources: affected_paths(line),
            risks: catastrophic.iter().map(|p| p.name.to_string()).collect(),
            alternatives: catastrophic.iter().filter_map(|p| p.alternative).map(String::from).collect(),
            source: AnalysisSource::Fallback,
        };
    }

    let risky: Vec<&RiskPattern> = RISKY.iter().filter(|p| p.regex.is_match(line)).collect();
    if let Some(first) = risky.first() {
        return Analysis {
            verdict: Verdict::Warn,
            risk_level: RiskLevel::High,
            confidence: 0.8,
            explanation: first.reason.to_string(),
            recommendation: "Review the command before approving it.".to_string(),
            affected_resources: affected_paths(line),
            risks: risky.iter().map(|p| p.name.to_string()).collect(),
            alternatives: risky.iter().filter_map(|p| p.alternative).map(String::from).collect(),
            source: AnalysisSource::Fallback,
        };
    }

    let base = line.split_whitespace().next().unwrap_or_default();
    if ALWAYS_DANGEROUS.contains(&base) || is_mkfs_variant(base) {
        return warn(
            line,
            RiskLevel::High,
            format!("'{base}' can change system state irreversibly."),
        );
    }

    if is_safe_prefix(line) && !has_shell_operator(line) && refined_args_ok(line) {
        return Analysis {
            verdict: Verdict::Allow,
            risk_level: RiskLevel::Low,
            confidence: 0.9,
            explanation: "Read-only command.".to_string(),
            recommendation: String::new(),
            affected_resources: Vec::new(),
            risks: Vec::new(),
            alternatives: Vec::new(),
            source: AnalysisSource::Fallback,
        };
    }

    warn(
        line,
        RiskLevel::Medium,
        "Command is not recognized by the local classifier.".to_string(),
    )
}

fn warn(line: &str, risk_level: RiskLevel, explanation: String) -> Analysis {
    Analysis {
        verdict: Verdict::Warn,
        risk_level,
        confidence: 0.5,
        explanation,
        recommendation: "Review the command before approving it.".to_string(),
        affected_resources: affected_paths(line),
        risks: Vec::new(),
        alternatives: Vec::new(),
        source: AnalysisSource::Fallback,
    }
}

/// A safe prefix still loses to an argument that writes or runs a program,
/// e.g. `git diff --output=FILE` or `git diff --ext-diff`.
fn refined_args_ok(line: &str) -> bool {
    let mut words = line.split_whitespace();
    let base = words.next().unwrap_or_default();
    if ALWAYS_SAFE.contains(&base) || !READ_ONLY.contains(&base) {
        return true;
    }
    let args: Vec<String> = words.map(String::from).collect();
    read_only_args_ok(base, &args)
}

fn is_safe_prefix(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    SAFE_PREFIXES.iter().any(|prefix| {
        lower == *prefix
            || lower
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with(char::is_whitespace))
    })
}

/// Path-like operands, for display.
fn affected_paths(line: &str) -> Vec<String> {
    line.split_whitespace()
        .skip(1)
        .filter(|w| w.starts_with('/') || w.starts_with('~') || w.starts_with("./"))
        .map(String::from)
        .collect()
}
