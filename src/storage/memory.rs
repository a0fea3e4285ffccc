//! In-memory storage engine
//!
//! Namespaces map document ids to JSON documents. Inserts create their
//! namespace implicitly and overwrite an existing document, so replaying a
//! record is harmless. Updates and deletes report their missing targets so
//! the worker pool can decide whether the miss is an idempotent replay.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::{Map, Value};

use super::engine::{ApplyMode, MultikeyPathInfo, SideEffects, StorageEngine};
use super::errors::{StorageError, StorageResult};
use crate::oplog::{CommandKind, OpKind, OpTime, OperationRecord};

#[derive(Debug, Default)]
struct Collection {
    capped: bool,
    documents: BTreeMap<String, Value>,
    multikey: BTreeMap<String, OpTime>,
}

#[derive(Debug, Default)]
struct State {
    collections: BTreeMap<String, Collection>,
    commands: Vec<(u64, String)>,
}

/// One applied record, in the order storage saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEntry {
    /// Sequence number of the record
    pub seq: u64,
    /// Namespace
    pub namespace: String,
    /// Document id, for CRUD records
    pub doc_id: Option<String>,
}

/// Shared in-memory storage.
#[derive(Debug)]
pub struct MemoryStorage {
    state: Mutex<State>,
    applied: Mutex<Vec<AppliedEntry>>,
    failures: Mutex<HashMap<u64, StorageError>>,
    durability_failure: Mutex<Option<StorageError>>,
    document_locking: bool,
    async_durability: AtomicBool,
    durable_waits: AtomicU64,
    batches_completed: AtomicU64,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Storage with document-level locking.
    pub fn new() -> Self {
        Self::with_document_locking(true)
    }

    /// Storage with an explicit document-locking capability.
    pub fn with_document_locking(document_locking: bool) -> Self {
        Self {
            state: Mutex::new(State::default()),
            applied: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            durability_failure: Mutex::new(None),
            document_locking,
            async_durability: AtomicBool::new(false),
            durable_waits: AtomicU64::new(0),
            batches_completed: AtomicU64::new(0),
        }
    }

    /// Report durability asynchronously.
    pub fn set_async_durability(&self, enabled: bool) {
        self.async_durability.store(enabled, Ordering::SeqCst);
    }

    /// Create a namespace.
    pub fn create_namespace(&self, namespace: &str, capped: bool) {
        let mut state = self.lock_state();
        state
            .collections
            .entry(namespace.to_string())
            .or_default()
            .capped = capped;
    }

    /// Fail the record at `seq` with `error`.
    pub fn inject_failure(&self, seq: u64, error: StorageError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(seq, error);
    }

    /// Fail the next durability wait with `error`.
    pub fn fail_durability(&self, error: StorageError) {
        *self
            .durability_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(error);
    }

    /// Current document, if present.
    pub fn document(&self, namespace: &str, doc_id: &str) -> Option<Value> {
        self.lock_state()
            .collections
            .get(namespace)
            .and_then(|c| c.documents.get(doc_id).cloned())
    }

    /// Whether a namespace exists.
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.lock_state().collections.contains_key(namespace)
    }

    /// Full contents, for state comparisons.
    pub fn dump(&self) -> BTreeMap<String, BTreeMap<String, Value>> {
        self.lock_state()
            .collections
            .iter()
            .map(|(ns, c)| (ns.clone(), c.documents.clone()))
            .collect()
    }

    /// Records in the order they were applied.
    pub fn applied(&self) -> Vec<AppliedEntry> {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Commands seen, as `(seq, name)`.
    pub fn commands(&self) -> Vec<(u64, String)> {
        self.lock_state().commands.clone()
    }

    /// Timestamp an index was marked multikey at.
    pub fn multikey_since(&self, namespace: &str, index_name: &str) -> Option<OpTime> {
        self.lock_state()
            .collections
            .get(namespace)
            .and_then(|c| c.multikey.get(index_name).copied())
    }

    /// Number of durability waits served.
    pub fn durable_waits(&self) -> u64 {
        self.durable_waits.load(Ordering::SeqCst)
    }

    /// Number of completed replication batches.
    pub fn batches_completed(&self) -> u64 {
        self.batches_completed.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_injected_failure(&self, seq: u64) -> Option<StorageError> {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&seq)
    }

    fn require_doc_id(record: &OperationRecord) -> StorageResult<String> {
        record.doc_id.clone().ok_or_else(|| {
            StorageError::Unsupported(format!(
                "{} on {} without document id",
                record.kind.as_str(),
                record.namespace
            ))
        })
    }

    fn multikey_effects(
        collection: &Collection,
        namespace: &str,
        document: &Value,
    ) -> Vec<MultikeyPathInfo> {
        let Value::Object(fields) = document else {
            return Vec::new();
        };
        let arrays: BTreeSet<&String> = fields
            .iter()
            .filter(|(_, v)| v.is_array())
            .map(|(k, _)| k)
            .collect();
        arrays
            .into_iter()
            .map(|field| (format!("{}_1", field), field))
            .filter(|(index, _)| !collection.multikey.contains_key(index))
            .map(|(index_name, field)| MultikeyPathInfo {
                namespace: namespace.to_string(),
                index_name,
                paths: vec![field.clone()],
            })
            .collect()
    }

    fn apply_update(current: &mut Value, change: &Value) {
        match (current, change.get("$set")) {
            (Value::Object(doc), Some(Value::Object(set))) => {
                for (k, v) in set {
                    doc.insert(k.clone(), v.clone());
                }
            }
            (current, _) => *current = change.clone(),
        }
    }

    fn apply_command(
        state: &mut State,
        record: &OperationRecord,
        command: &CommandKind,
    ) -> StorageResult<()> {
        let name = match command {
            CommandKind::ApplyOps => {
                return Err(StorageError::Unsupported(
                    "container records must be decomposed before storage".to_string(),
                ))
            }
            CommandKind::CommitTransaction { prepared: false } => {
                return Err(StorageError::Unsupported(
                    "unprepared commits must be decomposed before storage".to_string(),
                ))
            }
            CommandKind::CommitTransaction { prepared: true } => "commitPrepared".to_string(),
            CommandKind::PrepareTransaction => "prepareTransaction".to_string(),
            CommandKind::AbortTransaction => "abortTransaction".to_string(),
            CommandKind::Other { name } => {
                match name.as_str() {
                    "create" => {
                        let capped = record
                            .payload
                            .get("capped")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        state
                            .collections
                            .entry(record.namespace.clone())
                            .or_default()
                            .capped = capped;
                    }
                    "drop" => {
                        state.collections.remove(&record.namespace);
                    }
                    _ => {}
                }
                name.clone()
            }
        };
        state.commands.push((record.seq(), name));
        Ok(())
    }
}

impl StorageEngine for MemoryStorage {
    fn apply_record(
        &self,
        record: &OperationRecord,
        _mode: ApplyMode,
    ) -> StorageResult<SideEffects> {
        if let Some(err) = self.take_injected_failure(record.seq()) {
            return Err(err);
        }

        let mut state = self.lock_state();
        let mut effects = SideEffects::none();
        match &record.kind {
            OpKind::Insert => {
                let doc_id = Self::require_doc_id(record)?;
                let collection = state
                    .collections
                    .entry(record.namespace.clone())
                    .or_default();
                effects.multikey_paths =
                    Self::multikey_effects(collection, &record.namespace, &record.payload);
                collection.documents.insert(doc_id, record.payload.clone());
            }
            OpKind::Update => {
                let doc_id = Self::require_doc_id(record)?;
                let collection = state
                    .collections
                    .get_mut(&record.namespace)
                    .ok_or_else(|| StorageError::NamespaceNotFound(record.namespace.clone()))?;
                let multikey =
                    Self::multikey_effects(collection, &record.namespace, &record.payload);
                let current = collection.documents.get_mut(&doc_id).ok_or_else(|| {
                    StorageError::UpdateTargetMissing {
                        namespace: record.namespace.clone(),
                        doc_id: doc_id.clone(),
                    }
                })?;
                Self::apply_update(current, &record.payload);
                effects.multikey_paths = multikey;
            }
            OpKind::Delete => {
                let doc_id = Self::require_doc_id(record)?;
                let collection = state
                    .collections
                    .get_mut(&record.namespace)
                    .ok_or_else(|| StorageError::NamespaceNotFound(record.namespace.clone()))?;
                if collection.documents.remove(&doc_id).is_none() {
                    return Err(StorageError::DocumentNotFound {
                        namespace: record.namespace.clone(),
                        doc_id,
                    });
                }
            }
            OpKind::Command(command) => Self::apply_command(&mut state, record, command)?,
            OpKind::Noop => {}
        }
        drop(state);

        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AppliedEntry {
                seq: record.seq(),
                namespace: record.namespace.clone(),
                doc_id: record.doc_id.clone(),
            });
        Ok(effects)
    }

    fn insert_missing_document(
        &self,
        namespace: &str,
        doc_id: &str,
        document: Value,
    ) -> StorageResult<()> {
        let mut state = self.lock_state();
        state
            .collections
            .entry(namespace.to_string())
            .or_default()
            .documents
            .insert(doc_id.to_string(), document);
        Ok(())
    }

    fn set_index_multikey(&self, info: &MultikeyPathInfo, at: OpTime) -> StorageResult<()> {
        let mut state = self.lock_state();
        let collection = state
            .collections
            .get_mut(&info.namespace)
            .ok_or_else(|| StorageError::NamespaceNotFound(info.namespace.clone()))?;
        collection
            .multikey
            .entry(info.index_name.clone())
            .or_insert(at);
        Ok(())
    }

    fn replication_batch_complete(&self) {
        self.batches_completed.fetch_add(1, Ordering::SeqCst);
    }

    fn supports_document_locking(&self) -> bool {
        self.document_locking
    }

    fn is_capped(&self, namespace: &str) -> bool {
        self.lock_state()
            .collections
            .get(namespace)
            .map(|c| c.capped)
            .unwrap_or(false)
    }

    fn supports_async_durability(&self) -> bool {
        self.async_durability.load(Ordering::SeqCst)
    }

    fn wait_until_durable(&self) -> StorageResult<()> {
        self.durable_waits.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .durability_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Build a `$set` update payload from field pairs.
pub fn set_fields(fields: &[(&str, Value)]) -> Value {
    let mut set = Map::new();
    for (k, v) in fields {
        set.insert((*k).to_string(), v.clone());
    }
    let mut update = Map::new();
    update.insert("$set".to_string(), Value::Object(set));
    Value::Object(update)
}
