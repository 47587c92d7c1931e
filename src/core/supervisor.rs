//! Supervisor state machine.
//!
//! ```text
//! fork ──► Child:  ChildLauncher::run (never returns)
//!      └─► Parent: Supervisor<Launching> ──subscribe/narrow──► Supervisor<Monitoring> ──wait──► ExitStatus
//! ```
//!
//! Every parent-side failure kills the child through its descriptor before
//! the error is returned, so no jailed process outlives a failed supervisor.
//! A `Monitoring` supervisor holds nothing but the descriptor and the
//! monitor; there is no way back to the launching state:
//!
//! ```compile_fail
//! use quickjail::core::supervisor::{Monitoring, Supervisor};
//!
//! fn relaunch(s: Supervisor<Monitoring>) {
//!     let _ = s.establish(); // only defined for Supervisor<Launching>
//! }
//! ```

use crate::config::types::{JailError, LaunchRequest, Result, EXIT_FAILURE};
use crate::core::gate::CapabilityGate;
use crate::core::monitor::{ExitMonitor, ExitStatus};
use crate::exec::launcher::ChildLauncher;
use crate::kernel::jail::JailParams;
use crate::kernel::procdesc::{fork_with_descriptor, Forked, ProcessDescriptor};
use crate::observability::metrics;
use std::convert::Infallible;

/// State: child forked, monitoring not yet in place
pub struct Launching;

/// State: subscription registered and authority narrowed
pub struct Monitoring {
    monitor: ExitMonitor,
}

/// Parent side of one supervised run. Owns the child descriptor for its
/// whole lifetime.
pub struct Supervisor<S> {
    child: ProcessDescriptor,
    state: S,
}

impl<S> Supervisor<S> {
    /// Kill the child through its descriptor and hand `err` back.
    fn abort(self, err: JailError) -> JailError {
        terminate(&self.child);
        err
    }
}

impl Supervisor<Launching> {
    pub fn new(child: ProcessDescriptor) -> Self {
        Self {
            child,
            state: Launching,
        }
    }

    /// Register the exit subscription, then narrow the parent's rights.
    pub fn establish(self) -> Result<Supervisor<Monitoring>> {
        let monitor = match ExitMonitor::subscribe(&self.child) {
            Ok(monitor) => monitor,
            Err(err) => return Err(self.abort(err)),
        };
        if let Err(err) = CapabilityGate::new(&self.child, &monitor).narrow() {
            return Err(self.abort(err));
        }
        Ok(Supervisor {
            child: self.child,
            state: Monitoring { monitor },
        })
    }
}

impl Supervisor<Monitoring> {
    /// Block until the child exits. A failed read still kills the child.
    pub fn wait(self) -> Result<ExitStatus> {
        let Supervisor { child, state } = self;
        match state.monitor.wait() {
            Ok(status) => {
                log::info!("pid {} exited with code {}", child.pid(), status.code());
                Ok(status)
            }
            Err(err) => {
                terminate(&child);
                Err(err)
            }
        }
    }
}

fn terminate(child: &ProcessDescriptor) {
    metrics::handles().forced_kills.inc();
    match child.kill() {
        Ok(()) => log::warn!("killed pid {} after supervisor failure", child.pid()),
        Err(e) => log::warn!("failed to kill pid {}: {}", child.pid(), e),
    }
}

/// Fork, run `child_main` in the child and monitor it from the parent.
///
/// The parent narrows its own authority (capability mode, stdin retired), so
/// this is meant to be the last thing a supervising process does.
pub fn supervise<F>(child_main: F) -> Result<ExitStatus>
where
    F: FnOnce() -> Infallible,
{
    // SAFETY: the supervisor is single-threaded at this point, and the child
    // arm never returns into the caller.
    match unsafe { fork_with_descriptor() }? {
        Forked::Child => {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(child_main));
            if let Ok(never) = outcome {
                match never {}
            }
            // SAFETY: a panicking child must not unwind into the parent's code.
            unsafe { libc::_exit(EXIT_FAILURE) }
        }
        Forked::Parent(child) => Supervisor::new(child).establish()?.wait(),
    }
}

/// Launch `request` inside a fresh jail described by `params` and return the
/// command's exit status.
pub fn run(request: &LaunchRequest, params: &JailParams) -> Result<ExitStatus> {
    log::debug!(
        "launching {:?} with {} jail parameter(s)",
        request.program(),
        params.len()
    );
    supervise(|| ChildLauncher::new(request, params).run())
}
