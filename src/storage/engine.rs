//! Storage apply surface
//!
//! The apply engine never mutates storage directly; it hands records to an
//! implementation of `StorageEngine` together with the current apply mode.

use serde_json::Value;

use super::errors::StorageResult;
use crate::oplog::{OpTime, OperationRecord};

/// Context a record is applied under.
///
/// The mode decides which failures count as idempotent replay outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Replaying the local log after a crash
    Recovering,
    /// Catching up after initial data copy
    InitialCatchup,
    /// Normal follower operation
    Steady,
}

impl ApplyMode {
    /// Short name used in logs and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyMode::Recovering => "recovering",
            ApplyMode::InitialCatchup => "initial-catchup",
            ApplyMode::Steady => "steady",
        }
    }

    /// Whether missing namespaces on CRUD records are tolerated.
    pub fn tolerates_missing_namespace(&self) -> bool {
        matches!(self, ApplyMode::Recovering | ApplyMode::InitialCatchup)
    }
}

/// Multi-valued index paths discovered while applying a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultikeyPathInfo {
    /// Namespace owning the index
    pub namespace: String,
    /// Index name
    pub index_name: String,
    /// Paths that became multi-valued
    pub paths: Vec<String>,
}

/// Side output of applying one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideEffects {
    /// Newly multi-valued index paths
    pub multikey_paths: Vec<MultikeyPathInfo>,
}

impl SideEffects {
    /// No side effects.
    pub fn none() -> Self {
        Self::default()
    }
}

/// Storage engine as seen by the apply engine.
pub trait StorageEngine: Send + Sync {
    /// Apply one record in its own storage transaction.
    fn apply_record(&self, record: &OperationRecord, mode: ApplyMode)
        -> StorageResult<SideEffects>;

    /// Insert a document fetched from the sync source.
    fn insert_missing_document(
        &self,
        namespace: &str,
        doc_id: &str,
        document: Value,
    ) -> StorageResult<()>;

    /// Mark an index multikey, timestamped at `at`.
    fn set_index_multikey(&self, info: &MultikeyPathInfo, at: OpTime) -> StorageResult<()>;

    /// All writes of the current batch are finished.
    fn replication_batch_complete(&self) {}

    /// Whether writes to different documents may proceed concurrently.
    fn supports_document_locking(&self) -> bool;

    /// Whether `namespace` is capped (append-only, insertion ordered).
    fn is_capped(&self, namespace: &str) -> bool;

    /// Whether durability is confirmed asynchronously.
    fn supports_async_durability(&self) -> bool {
        false
    }

    /// Block until every write so far is durable.
    fn wait_until_durable(&self) -> StorageResult<()> {
        Ok(())
    }
}
