//! Observable apply engine events
//!
//! Events are explicit and typed; the logger only ever sees their stable
//! string names.

use std::fmt;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// Apply engine starting
    ApplierStart,
    /// Apply engine stopped cleanly
    ApplierStop,
    /// Batcher thread exiting
    BatcherStop,
    /// Async finalizer thread exiting
    FinalizerStop,

    // Batches
    /// Batch application failed (FATAL)
    BatchFailed,
    /// Batch starts at or before the last applied position (FATAL)
    OplogOutOfOrder,
    /// Lane reported a non-recoverable error (FATAL)
    LaneFailed,
    /// Per-record failure absorbed as idempotent replay
    IdempotentErrorIgnored,

    // Missing documents
    /// Fetching a missing update target from the sync source
    MissingDocumentFetch,
    /// Transient fetch failure, will retry
    MissingDocumentRetry,
    /// Sync source no longer has the document
    MissingDocumentGone,

    // Node state
    /// Moved to caught-up
    TransitionCaughtUp,
    /// Stayed in catching-up
    TransitionDeferred,
    /// Transition attempt refused by the node-state service
    TransitionFailed,

    // Recovery
    /// Partial local log tail discarded
    RecoveryTruncate,
    /// Local log replay batch applied
    RecoveryReplay,
}

impl Event {
    /// Stable event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ApplierStart => "APPLIER_START",
            Event::ApplierStop => "APPLIER_STOP",
            Event::BatcherStop => "BATCHER_STOP",
            Event::FinalizerStop => "FINALIZER_STOP",
            Event::BatchFailed => "APPLY_BATCH_FAILED",
            Event::OplogOutOfOrder => "APPLY_OPLOG_OUT_OF_ORDER",
            Event::LaneFailed => "APPLY_LANE_FAILED",
            Event::IdempotentErrorIgnored => "APPLY_IDEMPOTENT_ERROR_IGNORED",
            Event::MissingDocumentFetch => "MISSING_DOCUMENT_FETCH",
            Event::MissingDocumentRetry => "MISSING_DOCUMENT_RETRY",
            Event::MissingDocumentGone => "MISSING_DOCUMENT_GONE",
            Event::TransitionCaughtUp => "NODE_TRANSITION_CAUGHT_UP",
            Event::TransitionDeferred => "NODE_TRANSITION_DEFERRED",
            Event::TransitionFailed => "NODE_TRANSITION_FAILED",
            Event::RecoveryTruncate => "RECOVERY_TRUNCATE",
            Event::RecoveryReplay => "RECOVERY_REPLAY",
        }
    }

    /// Whether this event ends batch application.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Event::BatchFailed | Event::OplogOutOfOrder | Event::LaneFailed
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_events() {
        assert!(Event::OplogOutOfOrder.is_fatal());
        assert!(Event::LaneFailed.is_fatal());
        assert!(!Event::RecoveryReplay.is_fatal());
        assert!(!Event::IdempotentErrorIgnored.is_fatal());
    }

    #[test]
    fn test_names_are_upper_snake_case() {
        for event in [
            Event::ApplierStart,
            Event::TransitionDeferred,
            Event::RecoveryReplay,
        ] {
            assert!(event
                .as_str()
                .chars()
                .all(|c| c.is_ascii_uppercase() || c == '_'));
        }
    }
}
