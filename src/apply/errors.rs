//! Apply engine error types
//!
//! Taxonomy:
//! - Fatal: ordering violated, malformed container, empty commit, broken
//!   transaction chain, unrecoverable per-record apply failure. The engine
//!   stops and must not apply further batches.
//! - Idempotent failures are absorbed by the worker pool and never surface
//!   here.
//! - Transient fetch failures are retried by the worker pool and surface
//!   here only once retries are exhausted.

use std::fmt;

/// Apply engine error
#[derive(Debug, Clone)]
pub struct ApplyError {
    /// Error kind
    pub kind: ApplyErrorKind,
    /// Error message
    pub message: String,
    /// Offending record or batch, rendered for diagnosis
    pub context: Option<String>,
}

/// Apply engine error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyErrorKind {
    /// Batch does not start strictly after the last applied OpTime
    OplogOutOfOrder,

    /// Container record payload could not be parsed
    MalformedContainer,

    /// Transaction commit with no members
    EmptyTransaction,

    /// Previous-record link points at a missing or foreign record
    BrokenTransactionChain,

    /// Container nesting deeper than the configured limit
    NestingLimitExceeded,

    /// A record failed to apply and no idempotency rule covers it
    ApplyFailed,

    /// Missing document could not be fetched from the sync source
    MissingDocumentUnavailable,

    /// Node is the leader; followers-only path
    CannotApplyWhileLeader,

    /// Progress markers could not be read or persisted
    ProgressStore,

    /// Node-state transition refused
    IllegalTransition,

    /// Configuration rejected
    Configuration,
}

impl ApplyErrorKind {
    /// Stable code used in logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::OplogOutOfOrder => "APPLY_OPLOG_OUT_OF_ORDER",
            Self::MalformedContainer => "APPLY_MALFORMED_CONTAINER",
            Self::EmptyTransaction => "APPLY_EMPTY_TRANSACTION",
            Self::BrokenTransactionChain => "APPLY_BROKEN_TRANSACTION_CHAIN",
            Self::NestingLimitExceeded => "APPLY_NESTING_LIMIT_EXCEEDED",
            Self::ApplyFailed => "APPLY_FAILED",
            Self::MissingDocumentUnavailable => "APPLY_MISSING_DOCUMENT_UNAVAILABLE",
            Self::CannotApplyWhileLeader => "APPLY_WHILE_LEADER",
            Self::ProgressStore => "APPLY_PROGRESS_STORE",
            Self::IllegalTransition => "APPLY_ILLEGAL_TRANSITION",
            Self::Configuration => "APPLY_CONFIGURATION",
        }
    }
}

impl ApplyError {
    /// Create a new apply error.
    pub fn new(kind: ApplyErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
        }
    }

    /// Attach diagnostic context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Create an out-of-order error.
    pub fn oplog_out_of_order(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::OplogOutOfOrder, message)
    }

    /// Create a malformed container error.
    pub fn malformed_container(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::MalformedContainer, message)
    }

    /// Create an empty transaction error.
    pub fn empty_transaction(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::EmptyTransaction, message)
    }

    /// Create a broken chain error.
    pub fn broken_chain(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::BrokenTransactionChain, message)
    }

    /// Create a nesting limit error.
    pub fn nesting_limit(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::NestingLimitExceeded, message)
    }

    /// Create an apply failure.
    pub fn apply_failed(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::ApplyFailed, message)
    }

    /// Create a missing document error.
    pub fn missing_document(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::MissingDocumentUnavailable, message)
    }

    /// Create a leader error.
    pub fn cannot_apply_while_leader() -> Self {
        Self::new(
            ApplyErrorKind::CannotApplyWhileLeader,
            "attempting to apply replicated records while leader",
        )
    }

    /// Create a progress store error.
    pub fn progress_store(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::ProgressStore, message)
    }

    /// Create an illegal transition error.
    pub fn illegal_transition(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::IllegalTransition, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::Configuration, message)
    }

    /// Whether the engine must stop.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.kind,
            ApplyErrorKind::IllegalTransition | ApplyErrorKind::Configuration
        )
    }
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)?;
        if let Some(context) = &self.context {
            write!(f, " (record: {})", context)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApplyError {}

impl From<crate::progress::ProgressError> for ApplyError {
    fn from(err: crate::progress::ProgressError) -> Self {
        Self::progress_store(err.to_string())
    }
}

/// Result type for apply operations
pub type ApplyResult<T> = Result<T, ApplyError>;
