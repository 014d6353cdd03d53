// src/cli/mod.rs
//! Command-line interface definitions
//!
//! Parsed with `clap` derive; the binary in `main.rs` dispatches on
//! [`Action`].

/// Subcommand and option structs
pub mod commands;

pub use commands::{Action, BenchmarkOptions, Commands, ConfigOptions, StartOptions};
