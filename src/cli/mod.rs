//! Command-line interface for bananas.
//!
//! Provides commands for running the scheduler loop and for submitting,
//! inspecting and requeueing jobs.

mod commands;

pub use commands::{default_log_filter, parse_cli, run, run_with_cli, Cli};
