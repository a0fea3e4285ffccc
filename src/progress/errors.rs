//! Progress store errors

use thiserror::Error;

/// Result type for progress store operations
pub type ProgressResult<T> = Result<T, ProgressError>;

/// Progress store errors
#[derive(Debug, Error)]
pub enum ProgressError {
    /// Reading or persisting the markers failed
    #[error("progress store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Markers file could not be decoded
    #[error("progress markers malformed: {0}")]
    Malformed(String),

    /// Markers file checksum mismatch
    #[error("progress markers corrupt: expected checksum {expected:#010x}, found {found:#010x}")]
    Corrupt {
        /// Checksum stored in the file
        expected: u32,
        /// Checksum of the stored markers
        found: u32,
    },
}
