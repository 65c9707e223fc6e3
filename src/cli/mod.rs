//! Command-line interface for leasehold.
//!
//! Provides commands for schema migration, task administration, and running
//! workers with the built-in handlers.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
