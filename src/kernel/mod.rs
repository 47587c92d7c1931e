//! Thin wrappers around the kernel primitives the supervisor is built on.
//!
//! FreeBSD is the primary target; Linux provides process descriptors and the
//! event channel so the lifecycle can be exercised there too.

pub mod capsicum;
pub mod event;
pub mod jail;
pub mod procdesc;
