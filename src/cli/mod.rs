//! CLI module for repl-applier
//!
//! Provides command-line interface for:
//! - replay: apply a log file against in-memory storage, persisting progress
//! - inspect: print persisted progress markers

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command, ModeArg};
pub use commands::{inspect, replay, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{read_log, write_response};
