//! Process descriptors.
//!
//! A [`ProcessDescriptor`] is the only way the supervisor refers to its child.
//! It wraps a kernel handle (FreeBSD `pdfork(2)` descriptor, Linux pidfd) so
//! signals and exit notifications cannot reach a recycled PID.
//!
//! On FreeBSD closing the last reference to a descriptor created without
//! `PD_DAEMON` kills the child, so dropping a `ProcessDescriptor` early is
//! itself a termination path.

use crate::config::types::{JailError, Result};
use crate::observability::metrics;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Exclusively owned handle to the forked child.
#[derive(Debug)]
pub struct ProcessDescriptor {
    fd: OwnedFd,
    pid: Pid,
}

/// Result of forking: exactly one of the two arms runs in each process.
#[derive(Debug)]
pub enum Forked {
    Child,
    Parent(ProcessDescriptor),
}

impl ProcessDescriptor {
    /// PID for diagnostics. Never used to address the child.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send `SIGKILL` through the descriptor.
    pub fn kill(&self) -> nix::Result<()> {
        sys::kill(self)
    }
}

impl AsFd for ProcessDescriptor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for ProcessDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Fork the current process and obtain a descriptor for the child.
///
/// # Safety
///
/// Same contract as `fork(2)`: if the calling process has other threads, the
/// child may only use async-signal-safe operations until it execs or exits.
pub unsafe fn fork_with_descriptor() -> Result<Forked> {
    let forked = sys::fork()?;
    if let Forked::Parent(ref child) = forked {
        metrics::handles().process_descriptors.inc();
        log::debug!("forked child pid {} (descriptor fd {})", child.pid, child.fd.as_raw_fd());
    }
    Ok(forked)
}

#[cfg(target_os = "freebsd")]
mod sys {
    use super::*;
    use std::os::fd::FromRawFd;

    pub(super) unsafe fn fork() -> Result<Forked> {
        let mut fd: libc::c_int = -1;
        // SAFETY: pdfork only writes the descriptor number into `fd`, and only
        // in the parent.
        let pid = libc::pdfork(&mut fd, 0);
        match pid {
            -1 => Err(JailError::launch("pdfork", Errno::last())),
            0 => Ok(Forked::Child),
            pid => Ok(Forked::Parent(ProcessDescriptor {
                // SAFETY: pdfork returned a fresh descriptor owned by nobody else.
                fd: OwnedFd::from_raw_fd(fd),
                pid: Pid::from_raw(pid),
            })),
        }
    }

    pub(super) fn kill(child: &ProcessDescriptor) -> nix::Result<()> {
        // SAFETY: pdkill takes a descriptor and a signal number, no pointers.
        let rc = unsafe { libc::pdkill(child.as_raw_fd(), Signal::SIGKILL as libc::c_int) };
        Errno::result(rc).map(drop)
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use super::*;
    use nix::unistd::ForkResult;
    use rustix::process::{pidfd_open, pidfd_send_signal, PidfdFlags};

    fn errno(e: rustix::io::Errno) -> Errno {
        Errno::from_raw(e.raw_os_error())
    }

    pub(super) unsafe fn fork() -> Result<Forked> {
        match nix::unistd::fork().map_err(|e| JailError::launch("fork", e))? {
            ForkResult::Child => Ok(Forked::Child),
            ForkResult::Parent { child } => {
                // SAFETY: fork returned a positive PID for a child that is
                // ours and not yet reaped, so it cannot have been recycled.
                let pid = rustix::process::Pid::from_raw_unchecked(child.as_raw());
                match pidfd_open(pid, PidfdFlags::empty()) {
                    Ok(fd) => Ok(Forked::Parent(ProcessDescriptor { fd, pid: child })),
                    Err(e) => {
                        // No handle means no supervision; do not leave the child running.
                        let _ = nix::sys::signal::kill(child, Signal::SIGKILL);
                        let _ = nix::sys::wait::waitpid(child, None);
                        Err(JailError::launch("pidfd_open", errno(e)))
                    }
                }
            }
        }
    }

    pub(super) fn kill(child: &ProcessDescriptor) -> nix::Result<()> {
        pidfd_send_signal(child, rustix::process::Signal::KILL).map_err(errno)
    }
}

#[cfg(not(any(target_os = "freebsd", target_os = "linux")))]
mod sys {
    use super::*;

    pub(super) unsafe fn fork() -> Result<Forked> {
        Err(JailError::Unsupported("process descriptors"))
    }

    pub(super) fn kill(child: &ProcessDescriptor) -> nix::Result<()> {
        nix::sys::signal::kill(child.pid, Signal::SIGKILL)
    }
}
