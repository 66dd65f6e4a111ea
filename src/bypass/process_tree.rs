//! Process ancestry inspection.
//!
//! Linux reads `/proc/<pid>/stat` and `/proc/<pid>/cmdline` directly. Other
//! unix systems (macOS) shell out to `ps`, which is slower but needs no
//! privileges either.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

/// What the detector needs to know about one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: Option<u32>,
    /// Short executable name (`comm`).
    pub name: String,
    pub cmdline: Vec<String>,
    /// Time since the process started.
    pub age: Option<Duration>,
}

/// Capability to look up processes by pid.
pub trait ProcessTreeProvider: Send + Sync {
    fn process(&self, pid: u32) -> Option<ProcessInfo>;
}

/// Walk up from `start`, returning at most `max_depth` processes.
///
/// Stops at pid 0 or 1, on a lookup failure, or when a pid repeats.
pub fn ancestors(
    provider: &dyn ProcessTreeProvider,
    start: u32,
    max_depth: usize,
) -> Vec<ProcessInfo> {
    let mut chain = Vec::new();
    let mut next = Some(start);
    while let Some(pid) = next {
        if pid <= 1 || chain.len() >= max_depth || chain.iter().any(|p: &ProcessInfo| p.pid == pid)
        {
            break;
        }
        let Some(info) = provider.process(pid) else {
            break;
        };
        next = info.ppid;
        chain.push(info);
    }
    chain
}

/// `/proc` reader.
#[derive(Debug, Clone)]
pub struct ProcFsTree {
    root: PathBuf,
    clock_ticks: u64,
}

impl Default for ProcFsTree {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
            clock_ticks: crate::sys::clock_ticks_per_second(),
        }
    }
}

impl ProcFsTree {
    /// Reader over an alternative proc root (tests use a temp dir).
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>, clock_ticks: u64) -> Self {
        Self {
            root: root.into(),
            clock_ticks: clock_ticks.max(1),
        }
    }

    fn uptime(&self) -> Option<f64> {
        let raw = fs::read_to_string(self.root.join("uptime")).ok()?;
        raw.split_whitespace().next()?.parse().ok()
    }
}

impl ProcessTreeProvider for ProcFsTree {
    fn process(&self, pid: u32) -> Option<ProcessInfo> {
        let dir = self.root.join(pid.to_string());
        let stat = fs::read_to_string(dir.join("stat")).ok()?;
        let parsed = parse_stat(&stat)?;
        let cmdline = fs::read(dir.join("cmdline"))
            .map(|raw| {
                raw.split(|b| *b == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect()
            })
            .unwrap_or_default();
        let age = self.uptime().map(|uptime| {
            let started = parsed.start_ticks as f64 / self.clock_ticks as f64;
            Duration::from_secs_f64((uptime - started).max(0.0))
        });
        Some(ProcessInfo {
            pid,
            ppid: Some(parsed.ppid).filter(|p| *p > 0),
            name: parsed.comm,
            cmdline,
            age,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
struct StatFields {
    comm: String,
    ppid: u32,
    start_ticks: u64,
}

/// Parse `/proc/<pid>/stat`. `comm` may itself contain spaces and parens, so
/// it is delimited by the first `(` and the last `)`.
fn parse_stat(stat: &str) -> Option<StatFields> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?.to_string();
    let rest: Vec<&str> = stat.get(close + 1..)?.split_whitespace().collect();
    // rest[0] is field 3 (state); ppid is field 4, starttime field 22.
    let ppid = rest.get(1)?.parse().ok()?;
    let start_ticks = rest.get(19)?.parse().ok()?;
    Some(StatFields {
        comm,
        ppid,
        start_ticks,
    })
}

/// `ps`-based reader for systems without `/proc`.
#[derive(Debug, Clone, Default)]
pub struct PsTree;

impl ProcessTreeProvider for PsTree {
    fn process(&self, pid: u32) -> Option<ProcessInfo> {
        let output = Command::new("ps")
            .args(["-o", "ppid=,etime=,comm=", "-p", &pid.to_string()])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let line = String::from_utf8_lossy(&output.stdout);
        let mut fields = line.split_whitespace();
        let ppid: u32 = fields.next()?.parse().ok()?;
        let age = fields.next().and_then(parse_etime);
        let comm: Vec<&str> = fields.collect();
        let comm = comm.join(" ");
        let name = comm.rsplit('/').next().unwrap_or(&comm).to_string();

        let cmdline = Command::new("ps")
            .args(["-o", "args=", "-p", &pid.to_string()])
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| {
                String::from_utf8_lossy(&o.stdout)
                    .split_whitespace()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Some(ProcessInfo {
            pid,
            ppid: Some(ppid).filter(|p| *p > 0),
            name,
            cmdline,
            age,
        })
    }
}

/// Parse `ps` elapsed time: `[[dd-]hh:]mm:ss`.
fn parse_etime(raw: &str) -> Option<Duration> {
    let (days, clock) = match raw.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, raw),
    };
    let parts: Vec<u64> = clock
        .split(':')
        .map(|p| p.parse().ok())
        .collect::<Option<_>>()?;
    let (h, m, s) = match parts.as_slice() {
        [m, s] => (0, *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return None,
    };
    Some(Duration::from_secs(days * 86_400 + h * 3_600 + m * 60 + s))
}

/// Provider for the running platform.
#[must_use]
pub fn platform_tree() -> Arc<dyn ProcessTreeProvider> {
    if cfg!(target_os = "linux") {
        Arc::new(ProcFsTree::default())
    } else {
        Arc::new(PsTree)
    }
}
