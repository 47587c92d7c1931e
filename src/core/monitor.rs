use crate::config::types::Result;
use crate::kernel::event::{EventChannel, ExitWatch, RawWaitStatus};
use crate::kernel::procdesc::ProcessDescriptor;
use std::os::fd::{AsFd, BorrowedFd};

/// Exit code the supervisor hands back as its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(i32);

impl ExitStatus {
    /// Decode with `WEXITSTATUS`. A child killed by a signal decodes to 0;
    /// the signal is only logged.
    pub fn from_raw(raw: RawWaitStatus) -> Self {
        if let Some(signal) = raw.signal() {
            log::warn!(
                "child terminated by signal {}; reporting exit code {}",
                signal,
                raw.exit_code()
            );
        }
        ExitStatus(raw.exit_code())
    }

    pub fn code(self) -> i32 {
        self.0
    }
}

/// Owns the event channel and its single exit subscription.
#[derive(Debug)]
pub struct ExitMonitor {
    watch: ExitWatch,
}

impl ExitMonitor {
    /// Create the channel and register the exit subscription for `child`.
    pub fn subscribe(child: &ProcessDescriptor) -> Result<Self> {
        let watch = EventChannel::new()?.watch_exit(child)?;
        Ok(Self { watch })
    }

    /// Block for the one exit event.
    pub fn wait(self) -> Result<ExitStatus> {
        self.watch.wait().map(ExitStatus::from_raw)
    }
}

impl AsFd for ExitMonitor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.watch.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_exit_keeps_code() {
        assert_eq!(ExitStatus::from_raw(RawWaitStatus(3 << 8)).code(), 3);
        assert_eq!(ExitStatus::from_raw(RawWaitStatus(0)).code(), 0);
    }

    #[test]
    fn signalled_exit_decodes_to_zero() {
        let status = ExitStatus::from_raw(RawWaitStatus(libc::SIGTERM));
        assert_eq!(status.code(), 0);
    }
}
