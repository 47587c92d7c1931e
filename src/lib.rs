//! quickjail: run one command in a fresh, non-persistent FreeBSD jail.
//!
//! The supervisor forks with a process descriptor, lets the child chdir,
//! create-and-attach to a new jail and exec the command, and meanwhile
//! confines itself to Capsicum capability mode with only two handles left:
//! the child's descriptor and a kqueue subscribed to its exit. The
//! supervisor's exit code is the command's.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::procdesc`]: process descriptors (`pdfork`, `pdkill`)
//! - [`kernel::event`]: exit notification channel (kqueue `EVFILT_PROCDESC`)
//! - [`kernel::capsicum`]: rights limits and capability mode
//! - [`kernel::jail`]: typed jail parameters and `jail_set(2)`
//!
//! ## Execution Control ([`exec`])
//! - [`exec::launcher`]: type-state enforced chdir → jail → exec chain
//!
//! ## Supervision ([`core`])
//! - [`core::gate`]: one-way narrowing of the supervisor's authority
//! - [`core::monitor`]: exit subscription and status decoding
//! - [`core::supervisor`]: fork/launch/monitor state machine
//!
//! ## Observability ([`observability`])
//! - [`observability::metrics`]: kernel handle counters
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: settings, launch requests and the error taxonomy
//!
//! On Linux the descriptor and event channel are backed by pidfd and epoll,
//! so supervision can be exercised there; jails and Capsicum are FreeBSD only.

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Parent-side supervision
pub mod core;

// Observability
pub mod observability;

// Configuration
pub mod config;

// CLI entrypoint wiring shared by the quickjail/qjail binaries.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use core::monitor::ExitStatus;
pub use core::supervisor::{run, supervise};
