//! Classification of what is attached to standard input.

use serde::Serialize;
use std::io::IsTerminal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StdinKind {
    Terminal,
    Pipe,
    File,
    Socket,
    NullDevice,
    PtyMaster,
    Closed,
    Other,
}

/// Capability to inspect standard input.
pub trait StdinProbe: Send + Sync {
    fn kind(&self) -> StdinKind;
}

/// Probe for this process's real file descriptor 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct FdStdinProbe;

impl StdinProbe for FdStdinProbe {
    #[cfg(unix)]
    fn kind(&self) -> StdinKind {
        use std::fs::File;
        use std::os::fd::AsFd;
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let stdin = std::io::stdin();
        let Ok(owned) = stdin.as_fd().try_clone_to_owned() else {
            return StdinKind::Closed;
        };
        let Ok(meta) = File::from(owned).metadata() else {
            return StdinKind::Closed;
        };
        let file_type = meta.file_type();
        if file_type.is_fifo() {
            return StdinKind::Pipe;
        }
        if file_type.is_socket() {
            return StdinKind::Socket;
        }
        if file_type.is_file() {
            return StdinKind::File;
        }
        if file_type.is_char_device() {
            let same_device = |path: &str| {
                std::fs::metadata(path).is_ok_and(|m| m.rdev() == meta.rdev())
            };
            if same_device("/dev/null") {
                return StdinKind::NullDevice;
            }
            if same_device("/dev/ptmx") {
                return StdinKind::PtyMaster;
            }
            if stdin.is_terminal() {
                return StdinKind::Terminal;
            }
        }
        StdinKind::Other
    }

    #[cfg(not(unix))]
    fn kind(&self) -> StdinKind {
        if std::io::stdin().is_terminal() {
            StdinKind::Terminal
        } else {
            StdinKind::Pipe
        }
    }
}

/// Probe that always reports the same kind.
#[derive(Debug, Clone, Copy)]
pub struct FixedStdin(pub StdinKind);

impl StdinProbe for FixedStdin {
    fn kind(&self) -> StdinKind {
        self.0
    }
}
