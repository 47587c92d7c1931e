//! Parent-side supervision.
//!
//! The supervisor owns the child descriptor and the exit monitor, narrows its
//! own authority through the gate, then blocks for the child's exit.

pub mod gate;
pub mod monitor;
pub mod supervisor;
