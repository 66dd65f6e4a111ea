//! Thin wrappers over the few libc calls the gate needs.
#![allow(unsafe_code)]

/// Real user id of this process.
#[cfg(unix)]
#[must_use]
pub fn uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
#[must_use]
pub fn uid() -> u32 {
    0
}

/// Effective user id of this process.
#[cfg(unix)]
#[must_use]
pub fn euid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

#[cfg(not(unix))]
#[must_use]
pub fn euid() -> u32 {
    u32::MAX
}

/// Parent pid of this process.
#[cfg(unix)]
#[must_use]
pub fn parent_pid() -> Option<u32> {
    Some(std::os::unix::process::parent_id())
}

#[cfg(not(unix))]
#[must_use]
pub fn parent_pid() -> Option<u32> {
    None
}

/// Kernel clock ticks per second, as used by `/proc/<pid>/stat`.
#[cfg(unix)]
#[must_use]
pub fn clock_ticks_per_second() -> u64 {
    // SAFETY: sysconf only reads a configuration value.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as u64 } else { 100 }
}

#[cfg(not(unix))]
#[must_use]
pub fn clock_ticks_per_second() -> u64 {
    100
}

/// Discard input queued on `fd` but not yet read.
#[cfg(unix)]
pub fn discard_pending_input(fd: std::os::fd::BorrowedFd<'_>) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    // SAFETY: the descriptor is borrowed for the duration of the call.
    let rc = unsafe { libc::tcflush(fd.as_raw_fd(), libc::TCIFLUSH) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Wait up to `timeout` for `fd` to become readable.
///
/// `Ok(false)` means the wait timed out. `EINTR` is reported as not ready so
/// the caller's slice loop can recheck cancellation.
#[cfg(unix)]
pub fn poll_readable(
    fd: std::os::fd::BorrowedFd<'_>,
    timeout: std::time::Duration,
) -> std::io::Result<bool> {
    use std::os::fd::AsRawFd;
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    // SAFETY: pfd is a valid pollfd and nfds is 1.
    let rc = unsafe { libc::poll(&raw mut pfd, 1, millis) };
    match rc {
        0 => Ok(false),
        n if n > 0 => Ok(pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0),
        _ => {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }
}
