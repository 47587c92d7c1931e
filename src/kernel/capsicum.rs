//! Capsicum capability mode and per-descriptor rights.
//!
//! Every operation treats `ENOSYS` as success: a kernel built without
//! Capsicum keeps its ambient authority and the supervisor still works.
//! On platforms without Capsicum the calls are no-ops.

use nix::errno::Errno;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

const fn capright(idx: u32, bit: u64) -> u64 {
    (1u64 << (57 + idx)) | bit
}

pub const CAP_READ: u64 = capright(0, 0x1);
pub const CAP_WRITE: u64 = capright(0, 0x2);
pub const CAP_SEEK_TELL: u64 = capright(0, 0x4);
pub const CAP_SEEK: u64 = CAP_SEEK_TELL | 0x8;
pub const CAP_FCNTL: u64 = capright(0, 0x8000);
pub const CAP_FSTAT: u64 = capright(0, 0x80000);
pub const CAP_EVENT: u64 = capright(1, 0x20);
pub const CAP_KQUEUE_EVENT: u64 = capright(1, 0x40);
pub const CAP_IOCTL: u64 = capright(1, 0x80);
pub const CAP_PDKILL: u64 = capright(1, 0x800);

const CAP_RIGHTS_VERSION: u64 = 0;
const CAP_FCNTL_GETFL: u32 = 1 << 3;

// Terminal queries that stdio may still answer in capability mode.
const TIOCGETA: libc::c_ulong = 0x402c_7413;
const TIOCGWINSZ: libc::c_ulong = 0x4008_7468;
const FIODTYPE: libc::c_ulong = 0x4004_667a;
const STDIO_IOCTLS: [libc::c_ulong; 3] = [TIOCGETA, TIOCGWINSZ, FIODTYPE];

/// A `cap_rights_t` value.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapRights {
    cr_rights: [u64; 2],
}

impl CapRights {
    pub fn new(rights: &[u64]) -> Self {
        let mut set = Self {
            cr_rights: [(CAP_RIGHTS_VERSION << 62) | (1u64 << 57), 1u64 << 58],
        };
        for &right in rights {
            set.set(right);
        }
        set
    }

    pub fn set(&mut self, right: u64) {
        self.cr_rights[Self::index(right)] |= right;
    }

    pub fn contains(&self, right: u64) -> bool {
        self.cr_rights[Self::index(right)] & right == right
    }

    pub fn raw(&self) -> [u64; 2] {
        self.cr_rights
    }

    fn index(right: u64) -> usize {
        (((right >> 57) & 0x1f) as u32).trailing_zeros() as usize
    }
}

/// Whether the process ended up in capability mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityMode {
    Entered,
    /// The kernel has no Capsicum support; authority is unchanged.
    Unavailable,
}

/// Which direction a standard stream is used in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Read,
    Write,
}

impl StreamMode {
    pub fn rights(self) -> CapRights {
        let mut rights = CapRights::new(&[CAP_EVENT, CAP_FCNTL, CAP_FSTAT, CAP_IOCTL, CAP_SEEK]);
        match self {
            StreamMode::Read => rights.set(CAP_READ),
            StreamMode::Write => rights.set(CAP_WRITE),
        }
        rights
    }
}

/// Restrict `fd` to `rights`. Irreversible.
pub fn limit_rights(fd: BorrowedFd<'_>, rights: &CapRights) -> nix::Result<()> {
    tolerate_enosys(sys::rights_limit(fd.as_raw_fd(), rights))
}

/// Limit stdin, stdout and stderr the way `caph_limit_stdio(3)` does.
/// Streams that are already closed are skipped, as are `reserved`
/// descriptors that took over a stdio slot left closed by the caller.
pub fn limit_stdio(reserved: &[RawFd]) -> nix::Result<()> {
    let streams = [
        (libc::STDIN_FILENO, StreamMode::Read),
        (libc::STDOUT_FILENO, StreamMode::Write),
        (libc::STDERR_FILENO, StreamMode::Write),
    ];
    for (fd, mode) in streams {
        if reserved.contains(&fd) {
            log::debug!("fd {} is a supervisor handle, not a stdio stream", fd);
            continue;
        }
        limit_stream(fd, mode)?;
    }
    Ok(())
}

fn limit_stream(fd: RawFd, mode: StreamMode) -> nix::Result<()> {
    let ignore_ebadf = |r: nix::Result<()>| match r {
        Err(Errno::EBADF) => Ok(()),
        other => other,
    };
    ignore_ebadf(tolerate_enosys(sys::rights_limit(fd, &mode.rights())))?;
    ignore_ebadf(tolerate_enosys(sys::ioctls_limit(fd, &STDIO_IOCTLS)))?;
    ignore_ebadf(tolerate_enosys(sys::fcntls_limit(fd, CAP_FCNTL_GETFL)))?;
    Ok(())
}

/// Enter capability mode. There is no way back.
pub fn enter_capability_mode() -> nix::Result<CapabilityMode> {
    match sys::enter() {
        Ok(()) => Ok(CapabilityMode::Entered),
        Err(Errno::ENOSYS) => {
            log::debug!("kernel lacks Capsicum support; capability mode not entered");
            Ok(CapabilityMode::Unavailable)
        }
        Err(e) => Err(e),
    }
}

fn tolerate_enosys(result: nix::Result<()>) -> nix::Result<()> {
    match result {
        Err(Errno::ENOSYS) => Ok(()),
        other => other,
    }
}

#[cfg(target_os = "freebsd")]
mod sys {
    use super::*;

    extern "C" {
        fn cap_enter() -> libc::c_int;
        fn cap_rights_limit(fd: libc::c_int, rights: *const CapRights) -> libc::c_int;
        fn cap_ioctls_limit(
            fd: libc::c_int,
            cmds: *const libc::c_ulong,
            ncmds: libc::size_t,
        ) -> libc::c_int;
        fn cap_fcntls_limit(fd: libc::c_int, fcntlrights: u32) -> libc::c_int;
    }

    pub(super) fn enter() -> nix::Result<()> {
        // SAFETY: cap_enter takes no arguments.
        Errno::result(unsafe { cap_enter() }).map(drop)
    }

    pub(super) fn rights_limit(fd: RawFd, rights: &CapRights) -> nix::Result<()> {
        // SAFETY: `rights` is a valid repr(C) cap_rights_t for the call.
        Errno::result(unsafe { cap_rights_limit(fd, rights) }).map(drop)
    }

    pub(super) fn ioctls_limit(fd: RawFd, cmds: &[libc::c_ulong]) -> nix::Result<()> {
        // SAFETY: pointer and length describe the same slice.
        Errno::result(unsafe { cap_ioctls_limit(fd, cmds.as_ptr(), cmds.len()) }).map(drop)
    }

    pub(super) fn fcntls_limit(fd: RawFd, rights: u32) -> nix::Result<()> {
        // SAFETY: plain integer arguments.
        Errno::result(unsafe { cap_fcntls_limit(fd, rights) }).map(drop)
    }
}

#[cfg(not(target_os = "freebsd"))]
mod sys {
    use super::*;

    pub(super) fn enter() -> nix::Result<()> {
        Err(Errno::ENOSYS)
    }

    pub(super) fn rights_limit(_fd: RawFd, _rights: &CapRights) -> nix::Result<()> {
        Err(Errno::ENOSYS)
    }

    pub(super) fn ioctls_limit(_fd: RawFd, _cmds: &[libc::c_ulong]) -> nix::Result<()> {
        Err(Errno::ENOSYS)
    }

    pub(super) fn fcntls_limit(_fd: RawFd, _rights: u32) -> nix::Result<()> {
        Err(Errno::ENOSYS)
    }
}
