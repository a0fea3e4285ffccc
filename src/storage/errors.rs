//! Storage errors
//!
//! The worker pool classifies these: some are absorbed as idempotent
//! replay outcomes depending on the apply mode, the rest are fatal.

use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by the storage apply surface
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Target namespace does not exist
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Delete target does not exist
    #[error("document {doc_id} not found in {namespace}")]
    DocumentNotFound {
        /// Namespace
        namespace: String,
        /// Document id
        doc_id: String,
    },

    /// Update target does not exist
    #[error("update target {doc_id} missing in {namespace}")]
    UpdateTargetMissing {
        /// Namespace
        namespace: String,
        /// Document id
        doc_id: String,
    },

    /// Record cannot be applied by storage as given
    #[error("unsupported record: {0}")]
    Unsupported(String),

    /// Any other storage failure
    #[error("storage failure: {0}")]
    Failure(String),
}
