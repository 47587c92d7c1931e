//! Observability
//!
//! Kernel handle accounting for the supervisor.

pub mod metrics;
