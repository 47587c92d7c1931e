//! Integration tests for the supervisor lifecycle
//!
//! `supervise` narrows the calling process (stdin retired, capability mode on
//! FreeBSD), so every run happens inside a forked helper. The helper reports
//! the supervised exit code, or a sentinel code when an invariant is broken.

#![cfg(any(target_os = "freebsd", target_os = "linux"))]

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use quickjail::exec::launcher::ChildLauncher;
use quickjail::kernel::jail::JailParams;
use quickjail::observability::metrics::HandleSnapshot;
use quickjail::{supervise, LaunchRequest, ParameterSet, Workdir};
use std::convert::Infallible;
use std::ffi::{OsStr, OsString};
use std::os::fd::AsRawFd;
use std::sync::Mutex;

static FORK_LOCK: Mutex<()> = Mutex::new(());

const SUPERVISOR_FAILED: i32 = 100;
const WRONG_HANDLE_COUNT: i32 = 101;

/// Run `body` in a forked helper and return the helper's exit code.
fn in_helper(body: impl FnOnce() -> i32) -> i32 {
    let _guard = FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    match unsafe { fork() }.expect("fork helper") {
        ForkResult::Child => {
            let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body))
                .unwrap_or(SUPERVISOR_FAILED);
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => match waitpid(child, None).expect("waitpid helper") {
            WaitStatus::Exited(_, code) => code,
            other => panic!("helper did not exit normally: {:?}", other),
        },
    }
}

/// Supervise `child_main` and check that exactly one descriptor and one
/// channel were created for the run.
fn supervised(child_main: impl FnOnce() -> Infallible) -> i32 {
    let before = HandleSnapshot::capture();
    let code = match supervise(child_main) {
        Ok(status) => status.code(),
        Err(_) => return SUPERVISOR_FAILED,
    };
    let delta = HandleSnapshot::capture().since(&before);
    if delta.process_descriptors != 1 || delta.event_channels != 1 || delta.forced_kills != 0 {
        return WRONG_HANDLE_COUNT;
    }
    code
}

fn exit_with(code: i32) -> impl FnOnce() -> Infallible {
    move || -> Infallible { unsafe { libc::_exit(code) } }
}

#[test]
fn exit_code_is_propagated() {
    assert_eq!(in_helper(|| supervised(exit_with(0))), 0);
    assert_eq!(in_helper(|| supervised(exit_with(1))), 1);
    assert_eq!(in_helper(|| supervised(exit_with(42))), 42);
}

#[test]
fn each_invocation_is_a_fresh_cycle() {
    let code = in_helper(|| {
        let first = supervised(exit_with(3));
        if first != 3 {
            return first;
        }
        // The second run starts already narrowed and with stdin retired.
        supervised(exit_with(4))
    });
    assert_eq!(code, 4);
}

#[test]
fn signal_termination_reports_zero() {
    let code = in_helper(|| {
        supervised(|| {
            unsafe { libc::raise(libc::SIGKILL) };
            unsafe { libc::_exit(5) }
        })
    });
    assert_eq!(code, 0);
}

#[test]
fn panicking_child_exits_one() {
    let code = in_helper(|| supervised(|| panic!("child setup failed")));
    assert_eq!(code, 1);
}

#[test]
fn workdir_is_entered_before_jail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();

    let code = in_helper(|| {
        let request = LaunchRequest::new(
            ParameterSet::new(),
            Workdir::Path(path.clone()),
            &[OsString::from("true")],
        )
        .unwrap();
        let params = JailParams::default();
        supervised(|| {
            let code = match ChildLauncher::new(&request, &params).enter_workdir() {
                Ok(_) if std::fs::write("sentinel", b"here").is_ok() => 0,
                _ => 1,
            };
            unsafe { libc::_exit(code) }
        })
    });

    assert_eq!(code, 0);
    assert_eq!(std::fs::read(dir.path().join("sentinel")).unwrap(), b"here");
}

#[test]
fn missing_workdir_fails_the_child() {
    let code = in_helper(|| {
        let request = LaunchRequest::new(
            ParameterSet::new(),
            Workdir::from_option(Some(OsStr::new("/nonexistent/quickjail"))),
            &[OsString::from("true")],
        )
        .unwrap();
        let params = JailParams::default();
        supervised(|| ChildLauncher::new(&request, &params).run())
    });
    assert_eq!(code, 1);
}

#[test]
fn closed_stdin_does_not_cost_a_handle() {
    // With fd 0 free the first handle lands there and must survive the
    // stdin retirement.
    let code = in_helper(|| {
        if nix::unistd::close(libc::STDIN_FILENO).is_err() {
            return SUPERVISOR_FAILED;
        }
        supervised(exit_with(6))
    });
    assert_eq!(code, 6);
}

#[test]
fn launch_failure_kills_the_child() {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};
    use std::fs::File;

    const NO_FAILURE: i32 = 102;
    const WRONG_COUNTS: i32 = 103;
    #[cfg(target_os = "linux")]
    const NOT_KILLED: i32 = 104;

    let code = in_helper(|| {
        // Leave exactly one free descriptor: the child handle gets it and
        // the event channel cannot be created.
        let (_, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        let first = File::open("/dev/null").unwrap();
        let soft = first.as_raw_fd() as libc::rlim_t + 16;
        setrlimit(Resource::RLIMIT_NOFILE, soft, hard).unwrap();
        let mut filler = vec![first];
        while let Ok(file) = File::open("/dev/null") {
            filler.push(file);
        }
        filler.pop();

        let before = HandleSnapshot::capture();
        let result = supervise(|| loop {
            unsafe { libc::pause() };
        });
        let delta = HandleSnapshot::capture().since(&before);
        drop(filler);

        if result.is_ok() {
            return NO_FAILURE;
        }
        if delta.process_descriptors != 1 || delta.event_channels != 0 || delta.forced_kills != 1 {
            return WRONG_COUNTS;
        }
        // On FreeBSD the dropped descriptor is a second kill path, and the
        // forced-kill count above is the check.
        #[cfg(target_os = "linux")]
        if !matches!(
            waitpid(nix::unistd::Pid::from_raw(-1), None),
            Ok(WaitStatus::Signaled(_, nix::sys::signal::Signal::SIGKILL, _))
        ) {
            return NOT_KILLED;
        }
        0
    });
    assert_eq!(code, 0);
}

#[cfg(target_os = "linux")]
#[test]
fn jail_attach_failure_is_an_ordinary_exit() {
    let code = in_helper(|| {
        let request =
            LaunchRequest::new(ParameterSet::new(), Workdir::Unchanged, &[OsString::from("true")])
                .unwrap();
        match quickjail::run(&request, &JailParams::default()) {
            Ok(status) => status.code(),
            Err(_) => SUPERVISOR_FAILED,
        }
    });
    assert_eq!(code, 1);
}
