//! Command-line interface for fleet-collect.
//!
//! Provides the `serve` command plus operator tools for migrations and
//! queue inspection.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, DeadLetterArgs};
