//! Kernel event channel for the child's exit.
//!
//! FreeBSD: a kqueue with one `EVFILT_PROCDESC`/`NOTE_EXIT` filter; the wait
//! status arrives in the event's `data` field.
//! Linux: an epoll set watching the pidfd for readability, followed by
//! `waitpid` to collect the status.
//!
//! Exit notifications are level/queued on both platforms, so a child that
//! exits before the subscription is registered is still reported.

use crate::config::types::{JailError, Result};
use crate::kernel::procdesc::ProcessDescriptor;
use crate::observability::metrics;
use nix::errno::Errno;
use nix::unistd::Pid;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

/// Raw wait status as reported by the kernel, before any decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawWaitStatus(pub i32);

impl RawWaitStatus {
    /// Exit code portion of the status (`WEXITSTATUS`). Signal terminations
    /// are not distinguished here.
    pub fn exit_code(self) -> i32 {
        libc::WEXITSTATUS(self.0)
    }

    /// Terminating signal, if the child was killed by one.
    pub fn signal(self) -> Option<i32> {
        if libc::WIFSIGNALED(self.0) {
            Some(libc::WTERMSIG(self.0))
        } else {
            None
        }
    }
}

/// Exclusively owned kernel event queue with no subscription yet.
#[derive(Debug)]
pub struct EventChannel {
    inner: sys::Channel,
}

/// The event channel after the exit subscription has been registered.
/// It can be read exactly once.
#[derive(Debug)]
pub struct ExitWatch {
    inner: sys::Channel,
    pid: Pid,
}

impl EventChannel {
    pub fn new() -> Result<Self> {
        let inner = sys::Channel::new().map_err(|e| JailError::launch(sys::CREATE_OP, e))?;
        metrics::handles().event_channels.inc();
        Ok(Self { inner })
    }

    /// Register the single "notify on exit" subscription for `child`.
    pub fn watch_exit(self, child: &ProcessDescriptor) -> Result<ExitWatch> {
        self.inner
            .register_exit(child)
            .map_err(|e| JailError::launch(sys::REGISTER_OP, e))?;
        log::debug!("subscribed to exit of pid {}", child.pid());
        Ok(ExitWatch {
            inner: self.inner,
            pid: child.pid(),
        })
    }
}

impl ExitWatch {
    /// Block until the child exits. `EINTR` is retried; anything else is fatal.
    pub fn wait(self) -> Result<RawWaitStatus> {
        let status = self
            .inner
            .wait_exit(self.pid)
            .map_err(|e| JailError::monitor(sys::WAIT_OP, e))?;
        log::debug!("pid {} exited with raw status {:#x}", self.pid, status.0);
        Ok(status)
    }
}

impl AsFd for ExitWatch {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl AsRawFd for ExitWatch {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.inner.as_fd().as_raw_fd()
    }
}

fn retry_eintr<T>(mut op: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

#[cfg(target_os = "freebsd")]
mod sys {
    use super::*;
    use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};

    pub(super) const CREATE_OP: &str = "kqueue";
    pub(super) const REGISTER_OP: &str = "kevent";
    pub(super) const WAIT_OP: &str = "kevent";

    #[derive(Debug)]
    pub(super) struct Channel {
        kq: Kqueue,
    }

    impl Channel {
        pub(super) fn new() -> nix::Result<Self> {
            Ok(Self { kq: Kqueue::new()? })
        }

        pub(super) fn register_exit(&self, child: &ProcessDescriptor) -> nix::Result<()> {
            let change = KEvent::new(
                child.as_raw_fd() as libc::uintptr_t,
                EventFilter::EVFILT_PROCDESC,
                EventFlag::EV_ADD,
                FilterFlag::NOTE_EXIT,
                0,
                0,
            );
            self.kq.kevent(&[change], &mut [], None)?;
            Ok(())
        }

        pub(super) fn wait_exit(&self, _pid: Pid) -> nix::Result<RawWaitStatus> {
            let mut events = [KEvent::new(
                0,
                EventFilter::EVFILT_PROCDESC,
                EventFlag::empty(),
                FilterFlag::empty(),
                0,
                0,
            )];
            loop {
                let n = retry_eintr(|| self.kq.kevent(&[], &mut events, None))?;
                if n > 0 {
                    return Ok(RawWaitStatus(events[0].data() as i32));
                }
            }
        }

        pub(super) fn as_fd(&self) -> BorrowedFd<'_> {
            self.kq.as_fd()
        }
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use super::*;
    use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

    pub(super) const CREATE_OP: &str = "epoll_create1";
    pub(super) const REGISTER_OP: &str = "epoll_ctl";
    pub(super) const WAIT_OP: &str = "epoll_wait";

    #[derive(Debug)]
    pub(super) struct Channel {
        epoll: Epoll,
    }

    impl Channel {
        pub(super) fn new() -> nix::Result<Self> {
            Ok(Self {
                epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
            })
        }

        pub(super) fn register_exit(&self, child: &ProcessDescriptor) -> nix::Result<()> {
            self.epoll.add(child, EpollEvent::new(EpollFlags::EPOLLIN, 0))
        }

        pub(super) fn wait_exit(&self, pid: Pid) -> nix::Result<RawWaitStatus> {
            let mut events = [EpollEvent::empty()];
            loop {
                let n = retry_eintr(|| self.epoll.wait(&mut events, EpollTimeout::NONE))?;
                if n > 0 {
                    break;
                }
            }

            // Raw status, matching what kqueue reports in `data`.
            let mut status: libc::c_int = 0;
            // SAFETY: `status` is a valid out-pointer; the pidfd is readable so
            // the child has exited and this does not block.
            retry_eintr(|| Errno::result(unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) }))?;
            Ok(RawWaitStatus(status))
        }

        pub(super) fn as_fd(&self) -> BorrowedFd<'_> {
            self.epoll.0.as_fd()
        }
    }
}

#[cfg(not(any(target_os = "freebsd", target_os = "linux")))]
mod sys {
    use super::*;

    pub(super) const CREATE_OP: &str = "kqueue";
    pub(super) const REGISTER_OP: &str = "kevent";
    pub(super) const WAIT_OP: &str = "kevent";

    #[derive(Debug)]
    pub(super) struct Channel {
        never: std::convert::Infallible,
    }

    impl Channel {
        pub(super) fn new() -> nix::Result<Self> {
            Err(Errno::ENOSYS)
        }

        pub(super) fn register_exit(&self, _child: &ProcessDescriptor) -> nix::Result<()> {
            match self.never {}
        }

        pub(super) fn wait_exit(&self, _pid: Pid) -> nix::Result<RawWaitStatus> {
            match self.never {}
        }

        pub(super) fn as_fd(&self) -> BorrowedFd<'_> {
            match self.never {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> RawWaitStatus {
        RawWaitStatus((code & 0xff) << 8)
    }

    #[test]
    fn exit_code_is_masked_from_status() {
        assert_eq!(exited(0).exit_code(), 0);
        assert_eq!(exited(1).exit_code(), 1);
        assert_eq!(exited(255).exit_code(), 255);
        assert_eq!(exited(3).signal(), None);
    }

    #[test]
    fn signal_termination_reports_zero_exit_code() {
        // SIGKILL with no core dump: the low seven bits carry the signal.
        let killed = RawWaitStatus(libc::SIGKILL);
        assert_eq!(killed.signal(), Some(libc::SIGKILL));
        assert_eq!(killed.exit_code(), 0);
    }
}
