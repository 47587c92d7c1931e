//! Child-side launch sequence.
//!
//! The sequence is fixed and runs only in the forked child:
//! 1. change into the requested working directory (skipped for `.`)
//! 2. create the jail and attach to it in one `jail_set(2)` call
//! 3. replace the process image with the command (`execvp`)
//!
//! Each step consumes the previous state, so the steps cannot be reordered
//! or skipped. Only `ChildLauncher<Jailed>` can exec:
//!
//! ```compile_fail
//! use quickjail::exec::launcher::ChildLauncher;
//! use quickjail::kernel::jail::JailParams;
//! use quickjail::{LaunchRequest, ParameterSet, Workdir};
//! use std::ffi::OsString;
//!
//! let req = LaunchRequest::new(ParameterSet::new(), Workdir::Unchanged, &[OsString::from("true")]).unwrap();
//! let params = JailParams::default();
//! let launcher = ChildLauncher::new(&req, &params);
//! launcher.exec(); // no exec outside the jail
//! ```
//!
//! ```compile_fail
//! use quickjail::exec::launcher::ChildLauncher;
//! use quickjail::kernel::jail::JailParams;
//! use quickjail::{LaunchRequest, ParameterSet, Workdir};
//! use std::ffi::OsString;
//!
//! let req = LaunchRequest::new(ParameterSet::new(), Workdir::Unchanged, &[OsString::from("true")]).unwrap();
//! let params = JailParams::default();
//! let launcher = ChildLauncher::new(&req, &params);
//! let _ = launcher.attach_jail(); // the workdir step comes first
//! ```
//!
//! ```compile_fail
//! use quickjail::exec::launcher::ChildLauncher;
//! use quickjail::kernel::jail::JailParams;
//! use quickjail::{LaunchRequest, ParameterSet, Workdir};
//! use std::ffi::OsString;
//!
//! let req = LaunchRequest::new(ParameterSet::new(), Workdir::Unchanged, &[OsString::from("true")]).unwrap();
//! let params = JailParams::default();
//! let launcher = ChildLauncher::new(&req, &params);
//! let _first = launcher.enter_workdir();
//! let _again = launcher.enter_workdir(); // state already consumed
//! ```

use crate::config::types::{program_name, JailError, LaunchRequest, Result, Workdir, EXIT_FAILURE};
use crate::kernel::jail::{self, JailParams};
use std::convert::Infallible;
use std::marker::PhantomData;

/// Type-state marker: fresh child, nothing done yet
pub struct Fresh;

/// Type-state marker: working directory settled
pub struct InWorkdir;

/// Type-state marker: attached to the new jail
pub struct Jailed;

/// Launch sequence for one child, tracking its progress in `S`.
pub struct ChildLauncher<'a, S> {
    request: &'a LaunchRequest,
    params: &'a JailParams,
    _state: PhantomData<S>,
}

impl<'a, S> ChildLauncher<'a, S> {
    fn advance<T>(self) -> ChildLauncher<'a, T> {
        ChildLauncher {
            request: self.request,
            params: self.params,
            _state: PhantomData,
        }
    }
}

impl<'a> ChildLauncher<'a, Fresh> {
    pub fn new(request: &'a LaunchRequest, params: &'a JailParams) -> Self {
        Self {
            request,
            params,
            _state: PhantomData,
        }
    }

    /// Run the whole sequence. Never returns: either the image is replaced
    /// or the child exits with [`EXIT_FAILURE`] after a one-line diagnostic.
    pub fn run(self) -> Infallible {
        let err = match self.enter_workdir().and_then(|l| l.attach_jail()) {
            Ok(jailed) => jailed.exec(),
            Err(err) => err,
        };
        eprintln!("{}: {}", program_name(), err);
        // SAFETY: _exit skips atexit handlers and stdio buffers inherited from
        // the supervisor, which must not be flushed twice.
        unsafe { libc::_exit(EXIT_FAILURE) }
    }

    /// Step 1: move into the working directory. A failure here happens
    /// before any jail exists.
    pub fn enter_workdir(self) -> Result<ChildLauncher<'a, InWorkdir>> {
        match self.request.workdir() {
            Workdir::Unchanged => log::debug!("keeping current directory"),
            Workdir::Path(path) => {
                std::env::set_current_dir(path).map_err(|e| JailError::child("chdir", e))?;
                log::debug!("changed directory to {}", path.display());
            }
        }
        Ok(self.advance())
    }
}

impl<'a> ChildLauncher<'a, InWorkdir> {
    /// Step 2: create the jail and attach to it. There is no rollback; a
    /// failure ends the child.
    pub fn attach_jail(self) -> Result<ChildLauncher<'a, Jailed>> {
        jail::create_and_attach(self.params)?;
        Ok(self.advance())
    }
}

impl<'a> ChildLauncher<'a, Jailed> {
    /// Step 3: replace the process image, searching `PATH`. Returns only on
    /// failure.
    pub fn exec(self) -> JailError {
        let argv = self.request.argv();
        log::debug!("executing {:?}", argv);
        match nix::unistd::execvp(self.request.program(), argv) {
            Ok(never) => match never {},
            Err(e) => JailError::child("execvp", e),
        }
    }
}
