//! CLI argument definitions using clap
//!
//! Commands:
//! - repl-applier replay --config <path> --log <path> --progress <path> [--mode <mode>]
//! - repl-applier inspect --progress <path>
//!
//! `--log-level <level>` is accepted by every command.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::observability::Severity;
use crate::storage::ApplyMode;

/// Replicated-log apply engine for database followers
#[derive(Parser, Debug)]
#[command(name = "repl-applier")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest severity written to the log
    #[arg(long, global = true, value_enum, default_value_t = LogLevelArg::Info)]
    pub log_level: LogLevelArg,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply a JSON-lines log of records and print a progress summary
    Replay {
        /// Path to configuration file
        #[arg(long, default_value = "./repl-applier.json")]
        config: PathBuf,

        /// Path to the log, one JSON record per line
        #[arg(long)]
        log: PathBuf,

        /// Path to the progress markers file (created if missing)
        #[arg(long)]
        progress: PathBuf,

        /// Apply mode
        #[arg(long, value_enum, default_value_t = ModeArg::Steady)]
        mode: ModeArg,
    },

    /// Print persisted progress markers
    Inspect {
        /// Path to the progress markers file
        #[arg(long)]
        progress: PathBuf,
    },
}

/// Apply modes selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Normal follower operation
    Steady,
    /// Initial data copy catch-up; fetches missing update targets
    InitialCatchup,
}

impl From<ModeArg> for ApplyMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Steady => ApplyMode::Steady,
            ModeArg::InitialCatchup => ApplyMode::InitialCatchup,
        }
    }
}

/// Log levels selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevelArg {
    Trace,
    Info,
    Warn,
    Error,
    Fatal,
}

impl From<LogLevelArg> for Severity {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => Severity::Trace,
            LogLevelArg::Info => Severity::Info,
            LogLevelArg::Warn => Severity::Warn,
            LogLevelArg::Error => Severity::Error,
            LogLevelArg::Fatal => Severity::Fatal,
        }
    }
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
