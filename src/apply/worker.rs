//! Worker pool
//!
//! A fixed set of long-lived threads, one per lane. Each applies its lane's
//! records strictly in order. Failures covered by an idempotency rule for
//! the current apply mode count as success; anything else is fatal and is
//! reported back through the lane's reply channel.
//!
//! Idempotency rules:
//! - missing namespace on a CRUD record while recovering or catching up
//! - delete of a document, or from a namespace, that is already gone, in
//!   any mode
//! - update of a missing document while recovering
//! - update of a missing document while catching up: fetch it from the
//!   sync source, insert it and retry (capped namespaces never fetch)

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::errors::{ApplyError, ApplyResult};
use super::fetch::{fetch_with_retry, FetchPolicy, MissingDocumentSource};
use super::partition::WriterLane;
use crate::observability::{ApplyMetrics, Event, Logger};
use crate::oplog::{OpKind, OperationRecord};
use crate::storage::{ApplyMode, MultikeyPathInfo, StorageEngine, StorageError};

/// What every worker needs to apply a lane.
#[derive(Clone)]
pub struct LaneContext {
    /// Storage apply surface
    pub storage: Arc<dyn StorageEngine>,
    /// Metrics sink
    pub metrics: Arc<ApplyMetrics>,
    /// Sync source side channel for missing documents
    pub fetcher: Option<Arc<dyn MissingDocumentSource>>,
    /// Retry policy for missing-document fetches
    pub fetch_policy: FetchPolicy,
}

/// Apply one lane on the calling thread.
///
/// Returns the multikey paths discovered by the lane's records.
pub fn apply_lane(
    context: &LaneContext,
    lane: &WriterLane,
    mode: ApplyMode,
) -> ApplyResult<Vec<MultikeyPathInfo>> {
    let mut multikey = Vec::new();
    for record in lane.records() {
        multikey.extend(apply_one(context, record, mode)?);
    }
    Ok(multikey)
}

fn apply_one(
    context: &LaneContext,
    record: &OperationRecord,
    mode: ApplyMode,
) -> ApplyResult<Vec<MultikeyPathInfo>> {
    match context.storage.apply_record(record, mode) {
        Ok(effects) => {
            context.metrics.increment_ops_applied();
            Ok(effects.multikey_paths)
        }
        Err(err) => handle_failure(context, record, mode, err),
    }
}

fn handle_failure(
    context: &LaneContext,
    record: &OperationRecord,
    mode: ApplyMode,
    err: StorageError,
) -> ApplyResult<Vec<MultikeyPathInfo>> {
    match &err {
        StorageError::NamespaceNotFound(_) if record.kind == OpKind::Delete => {
            ignored(context, record, &err)
        }
        StorageError::NamespaceNotFound(_)
            if record.is_crud() && mode.tolerates_missing_namespace() =>
        {
            ignored(context, record, &err)
        }
        StorageError::DocumentNotFound { .. } if record.kind == OpKind::Delete => {
            ignored(context, record, &err)
        }
        StorageError::UpdateTargetMissing { .. } if mode == ApplyMode::Recovering => {
            ignored(context, record, &err)
        }
        StorageError::UpdateTargetMissing { namespace, doc_id }
            if mode == ApplyMode::InitialCatchup =>
        {
            if !fetch_missing(context, record, namespace, doc_id)? {
                return ignored(context, record, &err);
            }
            match context.storage.apply_record(record, mode) {
                Ok(effects) => {
                    context.metrics.increment_ops_applied();
                    Ok(effects.multikey_paths)
                }
                Err(retry) => Err(fatal(record, &retry)),
            }
        }
        _ => Err(fatal(record, &err)),
    }
}

/// Fetch and insert the target of `record`. Returns whether the update
/// should be retried.
fn fetch_missing(
    context: &LaneContext,
    record: &OperationRecord,
    namespace: &str,
    doc_id: &str,
) -> ApplyResult<bool> {
    let Some(fetcher) = context.fetcher.as_ref() else {
        return Ok(false);
    };
    if context.storage.is_capped(namespace) {
        return Ok(false);
    }
    let Some(document) = fetch_with_retry(fetcher.as_ref(), record, doc_id, context.fetch_policy)?
    else {
        return Ok(false);
    };
    context
        .storage
        .insert_missing_document(namespace, doc_id, document)
        .map_err(|e| fatal(record, &e))?;
    context.metrics.increment_missing_documents();
    Ok(true)
}

fn ignored(
    context: &LaneContext,
    record: &OperationRecord,
    err: &StorageError,
) -> ApplyResult<Vec<MultikeyPathInfo>> {
    context.metrics.increment_idempotent_errors();
    let seq = record.seq().to_string();
    let reason = err.to_string();
    Logger::trace(
        Event::IdempotentErrorIgnored.as_str(),
        &[("seq", &seq), ("reason", &reason)],
    );
    Ok(Vec::new())
}

fn fatal(record: &OperationRecord, err: &StorageError) -> ApplyError {
    ApplyError::apply_failed(format!("failed to apply {}: {}", record.kind.as_str(), err))
        .with_context(record.describe())
}

struct LaneTask {
    lane: WriterLane,
    mode: ApplyMode,
    reply: Sender<ApplyResult<Vec<MultikeyPathInfo>>>,
}

/// Fixed-size pool of lane workers.
pub struct WorkerPool {
    senders: Vec<Sender<LaneTask>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    pub fn start(size: usize, context: LaneContext) -> std::io::Result<Self> {
        let size = size.max(1);
        let mut senders = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);
        for id in 0..size {
            let (tx, rx) = mpsc::channel::<LaneTask>();
            let context = context.clone();
            let handle = thread::Builder::new()
                .name(format!("repl-writer-{}", id))
                .spawn(move || worker_loop(&context, rx))?;
            senders.push(tx);
            handles.push(handle);
        }
        Ok(Self { senders, handles })
    }

    /// Apply every non-empty lane in parallel and wait for all of them.
    ///
    /// Lanes that are already running finish even when another lane fails;
    /// the first failure, in lane order, is returned.
    pub fn apply_lanes(
        &self,
        lanes: Vec<WriterLane>,
        mode: ApplyMode,
    ) -> ApplyResult<Vec<MultikeyPathInfo>> {
        let mut replies: Vec<(usize, Receiver<ApplyResult<Vec<MultikeyPathInfo>>>)> = Vec::new();
        for lane in lanes.into_iter().filter(|l| !l.is_empty()) {
            let id = lane.id();
            let (reply, rx) = mpsc::channel();
            let worker = &self.senders[id % self.senders.len()];
            worker
                .send(LaneTask { lane, mode, reply })
                .map_err(|_| ApplyError::apply_failed(format!("writer {} is gone", id)))?;
            replies.push((id, rx));
        }

        let mut multikey = Vec::new();
        let mut first_error = None;
        for (id, rx) in replies {
            let outcome = rx.recv().unwrap_or_else(|_| {
                Err(ApplyError::apply_failed(format!(
                    "writer for lane {} exited without reporting",
                    id
                )))
            });
            match outcome {
                Ok(paths) => multikey.extend(paths),
                Err(err) => {
                    let lane = id.to_string();
                    let reason = err.to_string();
                    Logger::fatal(
                        Event::LaneFailed.as_str(),
                        &[("lane", &lane), ("reason", &reason)],
                    );
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(multikey),
        }
    }

    /// Stop accepting lanes and join every worker.
    pub fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(context: &LaneContext, tasks: Receiver<LaneTask>) {
    while let Ok(task) = tasks.recv() {
        let outcome = apply_lane(context, &task.lane, task.mode);
        let _ = task.reply.send(outcome);
    }
}
