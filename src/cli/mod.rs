//! Command-line interface
//!
//! Argument parsing for the `powledger` binary.

pub mod commands;

pub use commands::{Command, Opt};
