//! One-way narrowing of the supervisor's own authority.
//!
//! After [`CapabilityGate::narrow`] the parent can only wait on its exit
//! subscription and kill its child through the descriptor. Everything the
//! monitor needs must already be open and registered.

use crate::config::types::{JailError, Result};
use crate::core::monitor::ExitMonitor;
use crate::kernel::capsicum::{
    self, CapRights, CapabilityMode, CAP_EVENT, CAP_KQUEUE_EVENT, CAP_PDKILL,
};
use crate::kernel::procdesc::ProcessDescriptor;
use nix::errno::Errno;
use nix::unistd::close;
use std::os::fd::{AsFd, AsRawFd, RawFd};

/// Borrowed view of the two handles the narrowed parent keeps.
pub struct CapabilityGate<'a> {
    child: &'a ProcessDescriptor,
    monitor: &'a ExitMonitor,
}

impl<'a> CapabilityGate<'a> {
    pub fn new(child: &'a ProcessDescriptor, monitor: &'a ExitMonitor) -> Self {
        Self { child, monitor }
    }

    /// Limit both handles, retire stdin, limit stdio and enter capability
    /// mode, in that order.
    pub fn narrow(self) -> Result<CapabilityMode> {
        capsicum::limit_rights(self.child.as_fd(), &CapRights::new(&[CAP_PDKILL, CAP_EVENT]))
            .map_err(|e| JailError::launch("caph_rights_limit(procdesc)", e))?;
        capsicum::limit_rights(self.monitor.as_fd(), &CapRights::new(&[CAP_KQUEUE_EVENT]))
            .map_err(|e| JailError::launch("caph_rights_limit(kqueue)", e))?;

        let handles = [self.child.as_raw_fd(), self.monitor.as_fd().as_raw_fd()];
        retire_stdin(&handles).map_err(|e| JailError::launch("close(stdin)", e))?;
        capsicum::limit_stdio(&handles).map_err(|e| JailError::launch("caph_limit_stdio", e))?;

        let mode = capsicum::enter_capability_mode()
            .map_err(|e| JailError::launch("cap_enter", e))?;
        match mode {
            CapabilityMode::Entered => log::debug!("supervisor entered capability mode"),
            CapabilityMode::Unavailable => {
                log::info!("capability mode unavailable; supervisor keeps ambient authority")
            }
        }
        Ok(mode)
    }
}

/// The supervisor never reads stdin, so it is closed. If stdin was already
/// closed when supervision began, one of `handles` may now sit on fd 0 and
/// must be left alone.
fn retire_stdin(handles: &[RawFd]) -> nix::Result<()> {
    if handles.contains(&libc::STDIN_FILENO) {
        log::debug!("stdin was closed before supervision; fd 0 is a supervisor handle");
        return Ok(());
    }
    match close(libc::STDIN_FILENO) {
        Err(Errno::EBADF) => Ok(()),
        other => other,
    }
}

