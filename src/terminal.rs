//! Direct access to the controlling terminal.
//!
//! Approval prompts never touch the process's stdin/stdout: a caller that
//! controls those streams could answer its own prompt. The channel talks to
//! `/dev/tty` instead and is closed when dropped, on every exit path.

use crate::error_codes::GateError;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Controlling terminal device.
pub const TTY_PATH: &str = "/dev/tty";

/// Length of one blocking wait inside [`TerminalChannel::read_line`].
pub const READ_SLICE: Duration = Duration::from_millis(100);

/// Longest line accepted from the terminal.
const MAX_LINE: usize = 1024;

/// How a timed line read ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A full line, without its terminator.
    Line(String),
    TimedOut,
    Cancelled,
    /// End of file or hangup before a newline.
    Closed,
}

/// A bidirectional, exclusive terminal channel.
pub trait TerminalChannel: Send {
    /// Drop input typed before the prompt was shown.
    fn flush_input(&mut self) -> io::Result<()>;

    fn write_text(&mut self, text: &str) -> io::Result<()>;

    /// Read one line, giving up at `timeout` or as soon as `cancel` is set.
    fn read_line(&mut self, timeout: Duration, cancel: &AtomicBool) -> io::Result<ReadOutcome>;
}

/// Opens terminal channels.
pub trait TerminalProvider: Send + Sync {
    /// Open a fresh channel, or fail closed.
    fn open(&self) -> Result<Box<dyn TerminalChannel>, GateError>;

    /// Whether a trusted terminal is reachable at all.
    fn available(&self) -> bool;
}

/// `/dev/tty`, opened read-write.
#[derive(Debug)]
pub struct DevTty {
    file: File,
    pending: Vec<u8>,
}

impl DevTty {
    pub fn open() -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(TTY_PATH)?;
        tracing::trace!("terminal channel opened");
        Ok(Self {
            file,
            pending: Vec::new(),
        })
    }

    /// Split a complete line off the front of the pending buffer.
    fn take_line(&mut self) -> Option<String> {
        let pos = memchr::memchr(b'\n', &self.pending)?;
        let rest = self.pending.split_off(pos + 1);
        let mut line = std::mem::replace(&mut self.pending, rest);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl Drop for DevTty {
    fn drop(&mut self) {
        tracing::trace!("terminal channel closed");
    }
}

impl TerminalChannel for DevTty {
    #[cfg(unix)]
    fn flush_input(&mut self) -> io::Result<()> {
        use std::os::fd::AsFd;
        self.pending.clear();
        crate::sys::discard_pending_input(self.file.as_fd())
    }

    #[cfg(not(unix))]
    fn flush_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn write_text(&mut self, text: &str) -> io::Result<()> {
        self.file.write_all(text.as_bytes())?;
        self.file.flush()
    }

    #[cfg(unix)]
    fn read_line(&mut self, timeout: Duration, cancel: &AtomicBool) -> io::Result<ReadOutcome> {
        use std::os::fd::AsFd;

        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(ReadOutcome::Line(line));
            }
            if cancel.load(Ordering::Acquire) {
                return Ok(ReadOutcome::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ReadOutcome::TimedOut);
            }
            if !crate::sys::poll_readable(self.file.as_fd(), remaining.min(READ_SLICE))? {
                continue;
            }
            match self.file.read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    if self.pending.len() > MAX_LINE {
                        self.pending.truncate(MAX_LINE);
                        self.pending.push(b'\n');
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(not(unix))]
    fn read_line(&mut self, _timeout: Duration, _cancel: &AtomicBool) -> io::Result<ReadOutcome> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "timed terminal reads need poll(2)",
        ))
    }
}

/// Provider for the real controlling terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevTtyProvider;

impl TerminalProvider for DevTtyProvider {
    fn open(&self) -> Result<Box<dyn TerminalChannel>, GateError> {
        DevTty::open()
            .map(|tty| Box::new(tty) as Box<dyn TerminalChannel>)
            .map_err(|e| GateError::no_terminal(&e.to_string()))
    }

    fn available(&self) -> bool {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(TTY_PATH)
            .is_ok()
    }
}

/// Provider for contexts that must never prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTerminal;

impl TerminalProvider for NoTerminal {
    fn open(&self) -> Result<Box<dyn TerminalChannel>, GateError> {
        Err(GateError::no_terminal("terminal prompts are disabled"))
    }

    fn available(&self) -> bool {
        false
    }
}
