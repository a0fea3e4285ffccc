//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero exit code.

use std::fmt;
use std::io;

use crate::apply::ApplyError;
use crate::progress::ProgressError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (files, stdout)
    IoError,
    /// A log line is not a valid record
    MalformedLog,
    /// Progress markers could not be read or written
    ProgressError,
    /// The apply engine stopped with an error
    ApplyFailed,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "REPL_CLI_CONFIG_ERROR",
            Self::IoError => "REPL_CLI_IO_ERROR",
            Self::MalformedLog => "REPL_CLI_MALFORMED_LOG",
            Self::ProgressError => "REPL_CLI_PROGRESS_ERROR",
            Self::ApplyFailed => "REPL_CLI_APPLY_FAILED",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    /// Create a new CLI error
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Config error
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    /// I/O error
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    /// Malformed log line
    pub fn malformed_log(line: usize, msg: impl fmt::Display) -> Self {
        Self::new(
            CliErrorCode::MalformedLog,
            format!("line {}: {}", line, msg),
        )
    }

    /// Apply failure
    pub fn apply_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ApplyFailed, msg)
    }

    /// Get the error code
    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<ProgressError> for CliError {
    fn from(e: ProgressError) -> Self {
        Self::new(CliErrorCode::ProgressError, e.to_string())
    }
}

impl From<ApplyError> for CliError {
    fn from(e: ApplyError) -> Self {
        match e.kind {
            crate::apply::ApplyErrorKind::Configuration => Self::config_error(e.to_string()),
            _ => Self::apply_failed(e.to_string()),
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
