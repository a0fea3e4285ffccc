//! Missing-document fetch from the sync source
//!
//! During initial catch-up an update can target a document that the data
//! copy never saw. The worker pool fetches it from the sync source and
//! inserts it before retrying the update.

use std::thread;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use super::errors::{ApplyError, ApplyResult};
use crate::observability::{Event, Logger};
use crate::oplog::OperationRecord;

/// Fetch failures reported by a `MissingDocumentSource`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Network failure; worth retrying
    #[error("network error fetching missing document: {0}")]
    Network(String),

    /// Anything else; retrying will not help
    #[error("failed to fetch missing document: {0}")]
    Other(String),
}

impl FetchError {
    /// Whether the fetch may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }
}

/// Side channel to the sync source for documents missing locally.
pub trait MissingDocumentSource: Send + Sync {
    /// Current version of the document, or `None` if the source no longer
    /// has it.
    fn fetch(&self, namespace: &str, doc_id: &str) -> Result<Option<Value>, FetchError>;
}

/// Retry policy for missing-document fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Total attempts
    pub attempts: u32,
    /// Attempt k sleeps k*k of this before retrying
    pub backoff: Duration,
}

/// Fetch the target of `record`, retrying transient failures.
///
/// Returns `Ok(None)` when the sync source no longer has the document.
pub fn fetch_with_retry(
    source: &dyn MissingDocumentSource,
    record: &OperationRecord,
    doc_id: &str,
    policy: FetchPolicy,
) -> ApplyResult<Option<Value>> {
    let seq = record.seq().to_string();
    Logger::info(
        Event::MissingDocumentFetch.as_str(),
        &[("namespace", record.namespace.as_str()), ("doc_id", doc_id), ("seq", &seq)],
    );

    let mut last_error = None;
    for attempt in 1..=policy.attempts {
        match source.fetch(&record.namespace, doc_id) {
            Ok(document) => {
                if document.is_none() {
                    Logger::info(
                        Event::MissingDocumentGone.as_str(),
                        &[("namespace", record.namespace.as_str()), ("doc_id", doc_id)],
                    );
                }
                return Ok(document);
            }
            Err(err) if err.is_transient() && attempt < policy.attempts => {
                let attempt_str = attempt.to_string();
                let reason = err.to_string();
                Logger::warn(
                    Event::MissingDocumentRetry.as_str(),
                    &[("attempt", &attempt_str), ("reason", &reason)],
                );
                thread::sleep(policy.backoff * attempt * attempt);
                last_error = Some(err);
            }
            Err(err) => {
                last_error = Some(err);
                break;
            }
        }
    }

    let reason = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no fetch attempted".to_string());
    Err(ApplyError::missing_document(format!(
        "could not fetch {} from {}: {}",
        doc_id, record.namespace, reason
    ))
    .with_context(record.describe()))
}
