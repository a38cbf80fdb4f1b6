//! Command-line interface for taskforge.
//!
//! Exposes the supervisor-driven entry points: a single worker poll
//! cycle, a one-shot monitoring snapshot, and a transport liveness
//! probe.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
