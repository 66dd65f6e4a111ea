//! Fast-path cache of commands known to be safe to run without analysis.
//!
//! Eligibility is decided cheapest-first:
//! 1. any shell metacharacter in the arguments rejects immediately
//! 2. a TTL-valid cache hit
//! 3. the always-safe table
//! 4. the read-only table, gated by a clean argument scan and per-command rules
//!
//! Positive results from tiers 3 and 4 are written back to the cache. TTL is
//! checked on every read; the periodic sweep only reclaims memory.

use crate::config::CacheConfig;
use crate::shell::{
    ALWAYS_SAFE, FIND_UNSAFE_ACTIONS, GIT_READ_SUBCOMMANDS, READ_ONLY, WRITE_ENABLING_OPTIONS,
    arg_has_metacharacters, base_name, has_metacharacters,
};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// sed commands and `s///` flags that write files or execute commands.
static SED_SIDE_EFFECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[;{}\s])[0-9,$!]*\s*[wWrRe](?:\s|$)|/[gpiImM0-9]*[we](?:\s|$|;)")
        .expect("sed side-effect regex should compile")
});

/// Options that make otherwise read-only tools run another program.
const EXECUTING_OPTIONS: &[&str] = &[
    "--pre",
    "--compress-program",
    "--to-command",
    "--checkpoint-action",
    "--use-compress-program",
    "--ext-diff",
    "--textconv",
];

/// tar long options that name a program or script to run.
const TAR_EXECUTING_OPTIONS: &[&str] = &[
    "info-script",
    "new-volume-script",
    "rsh-command",
    "rmt-command",
    "use-compress-program",
    "to-command",
    "checkpoint-action",
];

/// Git global options that take no value and run nothing.
const GIT_PLAIN_GLOBALS: &[&str] = &[
    "--no-pager",
    "-P",
    "--no-optional-locks",
    "--no-replace-objects",
    "--literal-pathspecs",
    "--glob-pathspecs",
    "--noglob-pathspecs",
    "--icase-pathspecs",
];

/// Git subcommands that list by default but mutate when given operands.
const GIT_LISTING_SUBCOMMANDS: &[&str] = &["branch", "tag", "remote"];

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub safe: bool,
    /// Exact argument vector; a hit requires the same order, since the key
    /// ignores it (`git log branch` and `git branch log` share a key).
    pub args: Vec<String>,
    pub inserted_at: Instant,
    pub hit_count: u64,
}

/// Which tier produced an eligibility decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPathTier {
    Metacharacter,
    Cache,
    AlwaysSafe,
    ReadOnly,
    NotEligible,
}

#[derive(Debug)]
pub struct FastPathCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
    extra_safe: Vec<String>,
}

impl FastPathCache {
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
            extra_safe: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_config(cfg: &CacheConfig) -> Self {
        Self::new(Duration::from_secs(cfg.ttl_secs), cfg.max_entries)
    }

    /// Treat these command names as always-safe in addition to the built-ins.
    #[must_use]
    pub fn with_extra_safe(mut self, names: Vec<String>) -> Self {
        self.extra_safe = names;
        self
    }

    /// True when `command args` may skip analysis.
    pub fn is_eligible(&self, command: &str, args: &[String]) -> bool {
        self.is_eligible_at(command, args, Instant::now())
    }

    /// [`FastPathCache::is_eligible`] with an explicit clock, for TTL tests.
    pub fn is_eligible_at(&self, command: &str, args: &[String], now: Instant) -> bool {
        !matches!(
            self.classify_at(command, args, now),
            FastPathTier::Metacharacter | FastPathTier::NotEligible
        )
    }

    /// Which tier decides `command args` at `now`.
    pub fn classify_at(&self, command: &str, args: &[String], now: Instant) -> FastPathTier {
        if has_metacharacters(args) || arg_has_metacharacters(command) {
            return FastPathTier::Metacharacter;
        }

        let key = fingerprint(command, args);
        if self.lookup(&key, args, now) {
            return FastPathTier::Cache;
        }

        let base = base_name(command);
        let tier = if ALWAYS_SAFE.contains(&base) || self.extra_safe.iter().any(|s| s == base) {
            FastPathTier::AlwaysSafe
        } else if READ_ONLY.contains(&base) && read_only_args_ok(base, args) {
            FastPathTier::ReadOnly
        } else {
            FastPathTier::NotEligible
        };

        if tier != FastPathTier::NotEligible {
            self.insert(key, args, now);
        }
        tier
    }

    fn lookup(&self, key: &str, args: &[String], now: Instant) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if now.saturating_duration_since(entry.inserted_at) >= self.ttl {
            entries.remove(key);
            return false;
        }
        if entry.args != args {
            return false;
        }
        entry.hit_count += 1;
        entry.safe
    }

    fn insert(&self, key: String, args: &[String], now: Instant) {
        let mut entries = self.lock();
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            evict_oldest(&mut entries);
        }
        entries.insert(
            key,
            CacheEntry {
                safe: true,
                args: args.to_vec(),
                inserted_at: now,
                hit_count: 0,
            },
        );
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, e| now.saturating_duration_since(e.inserted_at) < ttl);
        before - entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry for `command args`, if cached.
    #[must_use]
    pub fn entry(&self, command: &str, args: &[String]) -> Option<CacheEntry> {
        self.lock().get(&fingerprint(command, args)).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Spawn the periodic sweep on the current tokio runtime.
pub fn spawn_sweeper(cache: Arc<FastPathCache>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let removed = cache.sweep_expired(Instant::now());
            if removed > 0 {
                tracing::trace!(removed, "fast-path sweep");
            }
        }
    })
}

/// Remove the oldest tenth (at least one) of the entries by insertion time.
fn evict_oldest(entries: &mut HashMap<String, CacheEntry>) {
    let count = (entries.len() / 10).max(1);
    let mut by_age: Vec<(Instant, String)> = entries
        .iter()
        .map(|(k, e)| (e.inserted_at, k.clone()))
        .collect();
    by_age.sort_by_key(|(at, _)| *at);
    for (_, key) in by_age.into_iter().take(count) {
        entries.remove(&key);
    }
}

/// SHA-256 of the command and its sorted arguments.
#[must_use]
pub fn fingerprint(command: &str, args: &[String]) -> String {
    let mut sorted: Vec<&str> = args.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(command.as_bytes());
    for arg in sorted {
        hasher.update([0u8]);
        hasher.update(arg.as_bytes());
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Argument scan plus per-command refinement for a read-only command.
#[must_use]
pub fn read_only_args_ok(base: &str, args: &[String]) -> bool {
    args_are_clean(args) && refine(base, args)
}

/// No bare write-enabling or program-executing option.
fn args_are_clean(args: &[String]) -> bool {
    !args.iter().any(|arg| {
        let flag = arg.split_once('=').map_or(arg.as_str(), |(flag, _)| flag);
        WRITE_ENABLING_OPTIONS.contains(&flag)
            || EXECUTING_OPTIONS.contains(&flag)
            || abbreviates_guarded(flag)
    })
}

/// Long options that are real options in their own right while also being
/// prefixes of a guarded one.
const GUARDED_PREFIX_EXCEPTIONS: &[&str] = &["--text", "--checkpoint"];

/// `--ext` standing for `--ext-diff`: getopt and git both expand
/// unambiguous prefixes of long options.
fn abbreviates_guarded(flag: &str) -> bool {
    flag.len() >= 5
        && flag.starts_with("--")
        && !GUARDED_PREFIX_EXCEPTIONS.contains(&flag)
        && WRITE_ENABLING_OPTIONS
            .iter()
            .chain(EXECUTING_OPTIONS)
            .any(|opt| opt.len() > flag.len() && opt.starts_with(flag))
}

/// Per-command refinement for the read-only tier.
fn refine(base: &str, args: &[String]) -> bool {
    match base {
        "tar" => tar_is_listing(args),
        "find" => !args
            .iter()
            .any(|a| FIND_UNSAFE_ACTIONS.contains(&a.as_str()) || a.starts_with("-fprint")),
        "git" => git_is_read_only(args),
        "sed" => sed_is_read_only(args),
        "sort" => !args
            .iter()
            .any(|a| a.starts_with("-o") || a.starts_with("--output") || is_short_cluster_with(a, 'o')),
        _ => true,
    }
}

/// No in-place edit, no script file, and no script that writes or executes.
///
/// Scripts are checked wherever they appear: operands, `-e S`, `-eS`,
/// `--expression=S` and `--expression S`.
fn sed_is_read_only(args: &[String]) -> bool {
    let mut iter = args.iter();
    let mut options_done = false;
    while let Some(arg) = iter.next() {
        if options_done || arg == "-" || !arg.starts_with('-') {
            if SED_SIDE_EFFECT.is_match(arg) {
                return false;
            }
            continue;
        }
        if arg == "--" {
            options_done = true;
            continue;
        }
        if let Some(long) = arg.strip_prefix("--") {
            let (name, value) = match long.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (long, None),
            };
            // getopt accepts any unambiguous prefix of a long option.
            let abbreviates = |full: &str| !name.is_empty() && full.starts_with(name);
            if abbreviates("in-place") || abbreviates("file") {
                return false;
            }
            if abbreviates("expression") {
                let script = value.or_else(|| iter.next().map(String::as_str));
                if script.is_some_and(|s| SED_SIDE_EFFECT.is_match(s)) {
                    return false;
                }
            } else if abbreviates("line-length") && value.is_none() {
                iter.next();
            }
            continue;
        }
        let cluster = &arg[1..];
        for (pos, flag) in cluster.char_indices() {
            match flag {
                'i' | 'f' => return false,
                'e' => {
                    let rest = &cluster[pos + 1..];
                    let script = if rest.is_empty() {
                        iter.next().map(String::as_str)
                    } else {
                        Some(rest)
                    };
                    if script.is_some_and(|s| SED_SIDE_EFFECT.is_match(s)) {
                        return false;
                    }
                    break;
                }
                'l' => {
                    if cluster[pos + 1..].is_empty() {
                        iter.next();
                    }
                    break;
                }
                _ => {}
            }
        }
    }
    true
}

/// Listing mode (`-t`, `tvf`, `--list`) and no mode that extracts or writes.
fn tar_is_listing(args: &[String]) -> bool {
    let mut listing = false;
    for (i, arg) in args.iter().enumerate() {
        if let Some(long) = arg.strip_prefix("--") {
            match long {
                "list" => listing = true,
                "extract" | "get" | "create" | "append" | "update" | "delete" | "concatenate"
                | "catenate" => return false,
                _ if tar_option_executes(long.split_once('=').map_or(long, |(n, _)| n)) => {
                    return false;
                }
                _ => {}
            }
            continue;
        }
        // Traditional syntax puts the mode cluster first without a dash.
        let cluster = match arg.strip_prefix('-') {
            Some(cluster) => cluster,
            None if i == 0 => arg.as_str(),
            None => continue,
        };
        if cluster.is_empty() || !cluster.chars().all(|c| c.is_ascii_alphabetic()) {
            continue;
        }
        // `-F` runs a volume script, `-I` a compressor.
        if cluster.contains(['x', 'c', 'r', 'u', 'A', 'I', 'F']) {
            return false;
        }
        if cluster.contains('t') {
            listing = true;
        }
    }
    listing
}

/// A tar long option, possibly abbreviated, that names a program to run.
fn tar_option_executes(name: &str) -> bool {
    name.len() >= 3
        && name != "checkpoint"
        && TAR_EXECUTING_OPTIONS.iter().any(|opt| opt.starts_with(name))
}

/// Allow-listed read subcommand; listing subcommands only without operands.
///
/// Only option-free globals may precede the subcommand. `-c`, `--config-env`,
/// `--exec-path` and the rest can point git at another program.
fn git_is_read_only(args: &[String]) -> bool {
    if args
        .iter()
        .take_while(|a| a.starts_with('-'))
        .any(|a| !GIT_PLAIN_GLOBALS.contains(&a.as_str()))
    {
        return false;
    }
    let mut rest = args.iter().skip_while(|a| a.starts_with('-'));
    let Some(sub) = rest.next() else {
        return false;
    };
    if !GIT_READ_SUBCOMMANDS.contains(&sub.as_str()) {
        return false;
    }
    if GIT_LISTING_SUBCOMMANDS.contains(&sub.as_str()) {
        return rest.all(|a| {
            a.starts_with('-')
                && !matches!(
                    a.as_str(),
                    "-d" | "-D" | "-m" | "-M" | "-c" | "-C" | "-f" | "-a" | "-s" | "-u"
                        | "--delete" | "--move" | "--copy" | "--force" | "--set-upstream-to"
                )
        });
    }
    true
}

/// `-ni` style short-option cluster containing `flag`.
fn is_short_cluster_with(arg: &str, flag: char) -> bool {
    arg.len() > 2
        && arg.starts_with('-')
        && !arg.starts_with("--")
        && arg[1..].chars().all(|c| c.is_ascii_alphabetic())
        && arg[1..].contains(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    fn cache() -> FastPathCache {
        FastPathCache::new(Duration::from_secs(300), 100)
    }

    #[test]
    fn ls_is_eligible() {
        assert!(cache().is_eligible("ls", &args(&["-la"])));
    }

    #[test]
    fn find_exec_is_not_eligible() {
        assert!(!cache().is_eligible("find", &args(&[".", "-exec", "rm", "{}", ";"])));
        assert!(!cache().is_eligible("find", &args(&[".", "-delete"])));
        assert!(cache().is_eligible("find", &args(&[".", "-name", "Cargo.toml"])));
    }

    #[test]
    fn metacharacters_reject_safe_commands() {
        let c = cache();
        assert!(!c.is_eligible("ls", &args(&["-la", ";", "rm"])));
        assert!(!c.is_eligible("cat", &args(&["$(id)"])));
        assert!(!c.is_eligible("echo", &args(&["`reboot`"])));
    }

    #[test]
    fn metacharacter_check_precedes_cache() {
        let c = cache();
        let clean = args(&["a.txt"]);
        assert!(c.is_eligible("cat", &clean));
        assert!(!c.is_eligible("cat", &args(&["a.txt", "|", "sh"])));
    }

    #[test]
    fn env_and_printenv_are_excluded() {
        assert!(!cache().is_eligible("env", &[]));
        assert!(!cache().is_eligible("printenv", &[]));
    }

    #[test]
    fn refinements() {
        let c = cache();
        assert!(c.is_eligible("tar", &args(&["-tvf", "a.tar"])));
        assert!(c.is_eligible("tar", &args(&["--list", "-f", "a.tar"])));
        assert!(!c.is_eligible("tar", &args(&["-xvf", "a.tar"])));
        assert!(!c.is_eligible("tar", &args(&["-czf", "a.tgz", "dir"])));
        assert!(c.is_eligible("git", &args(&["status"])));
        assert!(c.is_eligible("git", &args(&["--no-pager", "log"])));
        assert!(!c.is_eligible("git", &args(&["push", "--force"])));
        assert!(!c.is_eligible("git", &[]));
        assert!(!c.is_eligible("sed", &args(&["-i", "s/a/b/", "f"])));
        assert!(!c.is_eligible("sed", &args(&["-ni", "s/a/b/", "f"])));
        assert!(c.is_eligible("sed", &args(&["-n", "1p", "f"])));
        assert!(!c.is_eligible("sort", &args(&["-o", "out", "in"])));
        assert!(!c.is_eligible("sort", &args(&["--output=out", "in"])));
        assert!(c.is_eligible("sort", &args(&["-r", "in"])));
    }

    #[test]
    fn tar_operand_named_like_a_mode_does_not_count() {
        let c = cache();
        assert!(!c.is_eligible("tar", &args(&["-xf", "test"])));
        assert!(!c.is_eligible("tar", &args(&["-tf", "a.tar", "--to-command=sh"])));
        assert!(!c.is_eligible("tar", &args(&["-tf", "a.tar", "--checkpoint-action=exec=id"])));
    }

    #[test]
    fn sed_scripts_with_side_effects() {
        let c = cache();
        assert!(c.is_eligible("sed", &args(&["s/hello/world/", "f"])));
        assert!(!c.is_eligible("sed", &args(&["s/a/b/w", "out", "f"])));
        assert!(!c.is_eligible("sed", &args(&["-n", "w out", "f"])));
        assert!(!c.is_eligible("sed", &args(&["1e id", "f"])));
    }

    #[test]
    fn sed_script_options_are_checked() {
        let c = cache();
        assert!(!c.is_eligible("sed", &args(&["--expression=1e id", "f"])));
        assert!(!c.is_eligible("sed", &args(&["--expression", "1e id", "f"])));
        assert!(!c.is_eligible("sed", &args(&["--expr=1e id", "f"])));
        assert!(!c.is_eligible("sed", &args(&["-e", "1e id", "f"])));
        assert!(!c.is_eligible("sed", &args(&["-ne1e id", "f"])));
        assert!(!c.is_eligible("sed", &args(&["-n", "-e", "w out", "f"])));
        assert!(!c.is_eligible("sed", &args(&["--", "1e id", "f"])));
        assert!(c.is_eligible("sed", &args(&["-e", "s/a/b/", "f"])));
        assert!(c.is_eligible("sed", &args(&["--expression=1p", "f"])));
    }

    #[test]
    fn sed_script_files_and_in_place_are_rejected() {
        let c = cache();
        for argv in [
            &["-f", "evil.sed", "f"][..],
            &["--file=evil.sed", "f"],
            &["--fi=evil.sed", "f"],
            &["--file", "evil.sed", "f"],
            &["-nf", "evil.sed", "f"],
            &["--in-place=.bak", "s/a/b/", "f"],
        ] {
            assert!(!c.is_eligible("sed", &args(argv)), "{argv:?}");
        }
    }

    #[test]
    fn tar_script_options_are_rejected() {
        let c = cache();
        for argv in [
            &["-tMf", "a.tar", "-F", "./evil.sh"][..],
            &["-tf", "a.tar", "--info-script=./evil.sh"],
            &["-tf", "a.tar", "--new-volume-script=./evil.sh"],
            &["-tf", "host:a.tar", "--rsh-command=./evil.sh"],
            &["-tf", "a.tar", "--use-compress-program=./evil.sh"],
            &["-tf", "a.tar", "-I", "./evil.sh"],
            &["-tf", "a.tar", "--info=./evil.sh"],
            &["-tf", "host:a.tar", "--rsh=./evil.sh"],
        ] {
            assert!(!c.is_eligible("tar", &args(argv)), "{argv:?}");
        }
    }

    #[test]
    fn git_globals_must_be_plain() {
        let c = cache();
        assert!(!c.is_eligible("git", &args(&["--config-env=core.pager=X", "log"])));
        assert!(!c.is_eligible("git", &args(&["--exec-path=/tmp/evil", "status"])));
        assert!(!c.is_eligible("git", &args(&["--git-dir=/tmp/x", "log"])));
        assert!(c.is_eligible("git", &args(&["-P", "--no-optional-locks", "status"])));
    }

    #[test]
    fn abbreviated_guarded_options_are_rejected() {
        let c = cache();
        assert!(!c.is_eligible("git", &args(&["diff", "--ext"])));
        assert!(!c.is_eligible("git", &args(&["log", "--textc"])));
        assert!(!c.is_eligible("git", &args(&["diff", "--outp=/tmp/x"])));
        assert!(!c.is_eligible("sort", &args(&["--compress=sh", "in"])));
        assert!(c.is_eligible("diff", &args(&["--text", "a", "b"])));
        assert!(c.is_eligible("tar", &args(&["-tf", "a.tar", "--checkpoint"])));
    }

    #[test]
    fn git_listing_subcommands_with_operands() {
        let c = cache();
        assert!(c.is_eligible("git", &args(&["branch", "--list"])));
        assert!(c.is_eligible("git", &args(&["remote", "-v"])));
        assert!(!c.is_eligible("git", &args(&["branch", "-D", "main"])));
        assert!(!c.is_eligible("git", &args(&["tag", "v1.0"])));
        assert!(!c.is_eligible("git", &args(&["remote", "add", "x", "url"])));
        assert!(!c.is_eligible("git", &args(&["-c", "core.pager=sh", "log"])));
    }

    #[test]
    fn executing_options_are_rejected() {
        let c = cache();
        assert!(!c.is_eligible("rg", &args(&["--pre", "sh", "x"])));
        assert!(!c.is_eligible("sort", &args(&["--compress-program=sh", "in"])));
    }

    #[test]
    fn unknown_and_dangerous_are_not_eligible() {
        assert!(!cache().is_eligible("rm", &args(&["-rf", "/"])));
        assert!(!cache().is_eligible("curl", &args(&["example.com"])));
    }

    #[test]
    fn positive_results_are_written_back() {
        let c = cache();
        let a = args(&["-la"]);
        let now = Instant::now();
        assert_eq!(c.classify_at("ls", &a, now), FastPathTier::AlwaysSafe);
        assert_eq!(c.classify_at("ls", &a, now), FastPathTier::Cache);
        assert_eq!(c.entry("ls", &a).map(|e| e.hit_count), Some(1));
        assert!(c.entry("rm", &args(&["x"])).is_none());
    }

    #[test]
    fn arg_order_does_not_change_fingerprint() {
        assert_eq!(
            fingerprint("ls", &args(&["-l", "-a"])),
            fingerprint("ls", &args(&["-a", "-l"]))
        );
        assert_ne!(fingerprint("ls", &args(&["-l"])), fingerprint("cat", &args(&["-l"])));
    }

    #[test]
    fn reordered_args_do_not_hit_cache() {
        let c = cache();
        assert!(c.is_eligible("git", &args(&["log", "branch"])));
        assert!(!c.is_eligible("git", &args(&["branch", "log"])));
    }

    #[test]
    fn expired_entries_are_absent() {
        let c = FastPathCache::new(Duration::from_secs(5), 100);
        let a = args(&["-la"]);
        let start = Instant::now();
        assert_eq!(c.classify_at("ls", &a, start), FastPathTier::AlwaysSafe);
        let later = start + Duration::from_secs(6);
        // Expired: falls back to the table, which re-inserts.
        assert_eq!(c.classify_at("ls", &a, later), FastPathTier::AlwaysSafe);
        assert_eq!(c.classify_at("ls", &a, later), FastPathTier::Cache);
    }

    #[test]
    fn sweep_removes_expired() {
        let c = FastPathCache::new(Duration::from_secs(5), 100);
        let start = Instant::now();
        c.classify_at("ls", &[], start);
        c.classify_at("pwd", &[], start + Duration::from_secs(4));
        assert_eq!(c.sweep_expired(start + Duration::from_secs(6)), 1);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn full_cache_evicts_oldest_tenth() {
        let c = FastPathCache::new(Duration::from_secs(300), 20);
        let start = Instant::now();
        for i in 0..20 {
            let a = vec![format!("file{i}")];
            c.classify_at("cat", &a, start + Duration::from_millis(i));
        }
        assert_eq!(c.len(), 20);
        c.classify_at("cat", &args(&["fresh"]), start + Duration::from_secs(1));
        // 2 oldest evicted, 1 inserted.
        assert_eq!(c.len(), 19);
        assert!(c.entry("cat", &args(&["file0"])).is_none());
        assert!(c.entry("cat", &args(&["file1"])).is_none());
        assert!(c.entry("cat", &args(&["file2"])).is_some());
    }

    #[test]
    fn extra_safe_names_from_config() {
        let c = cache().with_extra_safe(vec!["cargo-metadata".into()]);
        assert!(c.is_eligible("cargo-metadata", &[]));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_periodically() {
        let c = Arc::new(FastPathCache::new(Duration::from_millis(1), 10));
        c.classify_at("ls", &[], Instant::now() - Duration::from_secs(1));
        let handle = spawn_sweeper(Arc::clone(&c), Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(120)).await;
        tokio::task::yield_now().await;
        assert!(c.is_empty());
        handle.abort();
    }
}
