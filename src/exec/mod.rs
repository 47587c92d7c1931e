//! Child-side execution: working directory, jail attach, exec.

pub mod launcher;
