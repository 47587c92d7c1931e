//! Launch configuration and shared type definitions.
//!
//! The CLI builds a [`types::LaunchRequest`]; everything below it only reads it.

pub mod types;
