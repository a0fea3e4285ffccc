//! Apply orchestrator
//!
//! Pulls batches from the batcher and applies each one:
//! 1. refuse to run on a leader; the batch must start after last applied
//! 2. take the batch-application token
//! 3. outside recovery: set the truncate point, write the batch to the
//!    local oplog, clear the truncate point
//! 4. raise min-valid to the batch's last position
//! 5. expand and partition, run every lane on the worker pool
//! 6. record multikey paths, tell storage the batch is complete
//! 7. persist applied-through, hand progress to the finalizer
//!
//! Between batches, and whenever no batch arrives in time, it checks
//! whether the node may move from catching-up to caught-up.

use std::sync::Arc;

use super::batcher::BatchQueue;
use super::config::ApplierConfig;
use super::errors::{ApplyError, ApplyResult};
use super::fetch::{FetchPolicy, MissingDocumentSource};
use super::finalizer::Finalizer;
use super::lock::BatchApplicationLock;
use super::partition::Partitioner;
use super::worker::{LaneContext, WorkerPool};
use crate::crash_point::{maybe_crash, points};
use crate::node::{NodeState, NodeStateService};
use crate::observability::{log_event, ApplyMetrics, Event, Logger, ObservationScope};
use crate::oplog::{Batch, LocalOplog, OpTime};
use crate::progress::{AppliedPosition, DataConsistency, MemberProgress, ProgressStore};
use crate::storage::{ApplyMode, StorageEngine};

/// External collaborators of the apply engine.
#[derive(Clone)]
pub struct Collaborators {
    /// Storage apply surface
    pub storage: Arc<dyn StorageEngine>,
    /// The follower's own log
    pub oplog: Arc<dyn LocalOplog>,
    /// Crash-durable progress markers
    pub progress: Arc<dyn ProgressStore>,
    /// In-memory applied and durable positions
    pub member: Arc<MemberProgress>,
    /// Node-state service
    pub node: Arc<dyn NodeStateService>,
    /// Batch-application exclusivity token
    pub lock: Arc<BatchApplicationLock>,
    /// Metrics sink
    pub metrics: Arc<ApplyMetrics>,
    /// Sync source side channel for missing documents
    pub fetcher: Option<Arc<dyn MissingDocumentSource>>,
}

/// Drives batches through expansion, the worker pool and finalization.
pub struct Orchestrator {
    mode: ApplyMode,
    batch_wait: std::time::Duration,
    parts: Collaborators,
    finalizer: Arc<dyn Finalizer>,
    partitioner: Partitioner,
    workers: WorkerPool,
}

impl Orchestrator {
    /// Create an orchestrator and its worker pool.
    pub fn new(
        config: &ApplierConfig,
        mode: ApplyMode,
        parts: Collaborators,
        finalizer: Arc<dyn Finalizer>,
    ) -> ApplyResult<Self> {
        let context = LaneContext {
            storage: Arc::clone(&parts.storage),
            metrics: Arc::clone(&parts.metrics),
            fetcher: parts.fetcher.clone(),
            fetch_policy: FetchPolicy {
                attempts: config.missing_document_retries,
                backoff: config.missing_document_backoff(),
            },
        };
        let workers = WorkerPool::start(config.writer_threads, context).map_err(|e| {
            ApplyError::apply_failed(format!("failed to start writer threads: {}", e))
        })?;
        Ok(Self {
            mode,
            batch_wait: config.batch_wait_timeout(),
            partitioner: Partitioner::new(config.writer_threads, config.max_nesting_depth),
            parts,
            finalizer,
            workers,
        })
    }

    /// Skip records at or below `seq`.
    pub fn begin_applying_after(mut self, seq: u64) -> Self {
        self.partitioner = self.partitioner.with_begin_applying_after(seq);
        self
    }

    /// Apply mode.
    pub fn mode(&self) -> ApplyMode {
        self.mode
    }

    /// Consume batches until a shutdown marker arrives or a batch fails.
    pub fn run(&self, queue: &BatchQueue) -> ApplyResult<()> {
        loop {
            self.try_to_go_live()?;

            let Some(batch) = queue.next_batch(self.batch_wait) else {
                self.parts.node.signal_drain_complete();
                continue;
            };
            if batch.must_shutdown() {
                return Ok(());
            }
            if batch.is_empty() {
                continue;
            }

            if let Err(err) = self.apply_batch(batch) {
                let reason = err.to_string();
                log_event(Event::BatchFailed, &[("reason", &reason)]);
                return Err(err);
            }
        }
    }

    /// Apply one batch. Returns the batch's last position.
    pub fn apply_batch(&self, batch: Batch) -> ApplyResult<OpTime> {
        let (Some(first), Some(last)) = (batch.first_op_time(), batch.last_op_time()) else {
            return Ok(self.parts.member.last_applied().op_time);
        };
        let count = batch.len();
        let scope = ObservationScope::quiet(
            "APPLY_BATCH",
            vec![("first", first.seq.to_string()), ("last", last.seq.to_string())],
        );

        if self.parts.node.current_state() == NodeState::Leader {
            return Err(ApplyError::cannot_apply_while_leader());
        }

        let last_applied = self.parts.member.last_applied();
        if first <= last_applied.op_time {
            let first_str = first.to_string();
            let applied_str = last_applied.op_time.to_string();
            log_event(
                Event::OplogOutOfOrder,
                &[("batch_first", &first_str), ("last_applied", &applied_str)],
            );
            return Err(ApplyError::oplog_out_of_order(format!(
                "batch starts at {} but last applied is {}",
                first, last_applied.op_time
            ))
            .with_context(batch.records()[0].describe()));
        }
        let last_wall = batch
            .records()
            .last()
            .map(|r| r.wall_time)
            .unwrap_or(last_applied.wall_time);

        let guard = self.parts.lock.begin_batch();

        let records = batch.into_records();
        if self.mode != ApplyMode::Recovering {
            self.parts.progress.set_truncate_after_point(Some(first.seq))?;
            maybe_crash(points::APPLY_AFTER_TRUNCATE_POINT);

            self.parts.oplog.append(&records).map_err(|e| {
                ApplyError::apply_failed(format!("failed to write local oplog: {}", e))
            })?;
            maybe_crash(points::APPLY_AFTER_LOCAL_OPLOG_WRITE);

            self.parts.progress.set_truncate_after_point(None)?;
        }
        self.parts.progress.set_min_valid(last)?;
        maybe_crash(points::APPLY_AFTER_MIN_VALID);

        let lanes = self.partitioner.partition(
            records,
            self.parts.oplog.as_ref(),
            self.parts.storage.as_ref(),
            self.mode,
        )?;
        let multikey = self.workers.apply_lanes(lanes, self.mode)?;
        maybe_crash(points::APPLY_AFTER_LANES);

        self.parts.storage.replication_batch_complete();
        // Stamped at the batch start: early is safe, late is not
        for info in &multikey {
            self.parts
                .storage
                .set_index_multikey(info, first)
                .map_err(|e| {
                    ApplyError::apply_failed(format!(
                        "failed to mark {} multikey on {}: {}",
                        info.index_name, info.namespace, e
                    ))
                })?;
        }

        self.parts.progress.set_applied_through(last)?;
        maybe_crash(points::APPLY_AFTER_APPLIED_THROUGH);

        let now_applied = self.parts.member.last_applied().op_time;
        if now_applied != last_applied.op_time {
            return Err(ApplyError::oplog_out_of_order(format!(
                "last applied moved from {} to {} while applying a batch",
                last_applied.op_time, now_applied
            )));
        }

        let min_valid = self.parts.progress.markers()?.min_valid;
        let consistency = if last >= min_valid {
            DataConsistency::Consistent
        } else {
            DataConsistency::Inconsistent
        };
        self.finalizer
            .record(AppliedPosition::new(last, last_wall), consistency)?;
        drop(guard);

        let ops = count.to_string();
        let mode = self.mode.as_str();
        let micros = scope.complete(&[("ops", &ops), ("mode", mode)]);
        self.parts.metrics.record_batch(count, micros);
        Ok(last)
    }

    /// Move from catching-up to caught-up if allowed.
    ///
    /// Requires no maintenance override, a catching-up node, and
    /// applied-through at or past min-valid. Returns whether the node moved.
    pub fn try_to_go_live(&self) -> ApplyResult<bool> {
        let node = self.parts.node.as_ref();
        if node.in_maintenance() || node.current_state() != NodeState::CatchingUp {
            return Ok(false);
        }
        self.parts.metrics.increment_caught_up_attempts();

        let markers = self.parts.progress.markers()?;
        if markers.applied_through < markers.min_valid {
            let applied = markers.applied_through.to_string();
            let min_valid = markers.min_valid.to_string();
            Logger::trace(
                Event::TransitionDeferred.as_str(),
                &[("applied_through", &applied), ("min_valid", &min_valid)],
            );
            return Ok(false);
        }

        match node.transition_to(NodeState::CaughtUp) {
            Ok(()) => {
                let applied = markers.applied_through.to_string();
                log_event(Event::TransitionCaughtUp, &[("applied_through", &applied)]);
                Ok(true)
            }
            Err(err) if !err.is_fatal() => {
                let reason = err.to_string();
                Logger::warn(Event::TransitionFailed.as_str(), &[("reason", &reason)]);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Join the worker pool.
    pub fn shutdown(self) {
        self.workers.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::errors::ApplyErrorKind;
    use crate::apply::finalizer::SyncFinalizer;
    use crate::node::MemoryNodeState;
    use crate::oplog::{CommandKind, MemoryOplog, OperationRecord};
    use crate::progress::{MemoryProgressStore, ProgressMarkers};
    use crate::storage::MemoryStorage;
    use serde_json::json;

    struct Fixture {
        storage: Arc<MemoryStorage>,
        oplog: Arc<MemoryOplog>,
        progress: Arc<MemoryProgressStore>,
        node: Arc<MemoryNodeState>,
        member: Arc<MemberProgress>,
        orchestrator: Orchestrator,
    }

    fn fixture_with(mode: ApplyMode, markers: ProgressMarkers, state: NodeState) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let oplog = Arc::new(MemoryOplog::new());
        let progress = Arc::new(MemoryProgressStore::with_markers(markers));
        let node = Arc::new(MemoryNodeState::new(state));
        let member = Arc::new(MemberProgress::starting_at(AppliedPosition::new(
            markers.applied_through,
            chrono::Utc::now(),
        )));
        let parts = Collaborators {
            storage: storage.clone(),
            oplog: oplog.clone(),
            progress: progress.clone(),
            member: Arc::clone(&member),
            node: node.clone(),
            lock: Arc::new(BatchApplicationLock::new()),
            metrics: Arc::new(ApplyMetrics::new()),
            fetcher: None,
        };
        let config = ApplierConfig {
            writer_threads: 4,
            ..ApplierConfig::default()
        };
        let finalizer = Arc::new(SyncFinalizer::new(Arc::clone(&member)));
        let orchestrator = Orchestrator::new(&config, mode, parts, finalizer).unwrap();
        Fixture {
            storage,
            oplog,
            progress,
            node,
            member,
            orchestrator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ApplyMode::Steady, ProgressMarkers::default(), NodeState::CatchingUp)
    }

    fn inserts(range: std::ops::RangeInclusive<u64>) -> Batch {
        Batch::from_records(
            range
                .map(|i| OperationRecord::insert(i, "app.users", format!("u{}", i)))
                .collect(),
        )
    }

    #[test]
    fn test_batch_advances_markers_and_writes_oplog() {
        let f = fixture();
        let last = f.orchestrator.apply_batch(inserts(1..=10)).unwrap();
        assert_eq!(last.seq, 10);

        let markers = f.progress.markers().unwrap();
        assert_eq!(markers.applied_through.seq, 10);
        assert_eq!(markers.min_valid.seq, 10);
        assert_eq!(markers.truncate_after, None);
        assert_eq!(f.oplog.last_seq(), Some(10));
        assert_eq!(f.member.last_applied().op_time.seq, 10);
        assert_eq!(f.storage.batches_completed(), 1);
        f.orchestrator.shutdown();
    }

    #[test]
    fn test_out_of_order_batch_is_fatal() {
        let f = fixture();
        f.orchestrator.apply_batch(inserts(1..=5)).unwrap();
        let err = f.orchestrator.apply_batch(inserts(5..=8)).unwrap_err();
        assert_eq!(err.kind, ApplyErrorKind::OplogOutOfOrder);
        assert!(err.is_fatal());
        assert_eq!(f.progress.markers().unwrap().applied_through.seq, 5);
        f.orchestrator.shutdown();
    }

    #[test]
    fn test_leader_refuses_batches() {
        let f = fixture_with(ApplyMode::Steady, ProgressMarkers::default(), NodeState::Leader);
        let err = f.orchestrator.apply_batch(inserts(1..=2)).unwrap_err();
        assert_eq!(err.kind, ApplyErrorKind::CannotApplyWhileLeader);
        f.orchestrator.shutdown();
    }

    #[test]
    fn test_failed_lane_leaves_applied_through() {
        let f = fixture();
        f.storage.inject_failure(
            3,
            crate::storage::StorageError::Failure("checksum".to_string()),
        );
        let err = f.orchestrator.apply_batch(inserts(1..=6)).unwrap_err();
        assert_eq!(err.kind, ApplyErrorKind::ApplyFailed);
        let markers = f.progress.markers().unwrap();
        assert!(markers.applied_through.is_null());
        assert_eq!(markers.min_valid.seq, 6);
        f.orchestrator.shutdown();
    }

    #[test]
    fn test_recovering_mode_skips_oplog_write() {
        let f = fixture_with(
            ApplyMode::Recovering,
            ProgressMarkers::default(),
            NodeState::CatchingUp,
        );
        f.orchestrator.apply_batch(inserts(1..=3)).unwrap();
        assert!(f.oplog.is_empty());
        assert_eq!(f.progress.markers().unwrap().applied_through.seq, 3);
        f.orchestrator.shutdown();
    }

    #[test]
    fn test_multikey_stamped_at_batch_start() {
        let f = fixture();
        let batch = Batch::from_records(vec![
            OperationRecord::insert(4, "app.posts", "a"),
            OperationRecord::insert(5, "app.posts", "b").with_payload(json!({"tags": ["x", "y"]})),
        ]);
        f.orchestrator.apply_batch(batch).unwrap();
        assert_eq!(
            f.storage.multikey_since("app.posts", "tags_1"),
            Some(OpTime::new(4, 1))
        );
        f.orchestrator.shutdown();
    }

    #[test]
    fn test_caught_up_gated_on_min_valid() {
        let markers = ProgressMarkers {
            applied_through: OpTime::new(5, 1),
            min_valid: OpTime::new(20, 1),
            truncate_after: None,
        };
        let f = fixture_with(ApplyMode::Steady, markers, NodeState::CatchingUp);

        assert!(!f.orchestrator.try_to_go_live().unwrap());
        assert_eq!(f.node.current_state(), NodeState::CatchingUp);

        f.orchestrator.apply_batch(inserts(6..=12)).unwrap();
        assert!(!f.orchestrator.try_to_go_live().unwrap());
        assert_eq!(f.node.current_state(), NodeState::CatchingUp);

        f.orchestrator.apply_batch(inserts(13..=20)).unwrap();
        assert!(f.orchestrator.try_to_go_live().unwrap());
        assert_eq!(f.node.current_state(), NodeState::CaughtUp);
        f.orchestrator.shutdown();
    }

    #[test]
    fn test_maintenance_blocks_caught_up() {
        let f = fixture();
        f.node.set_maintenance(true);
        f.orchestrator.apply_batch(inserts(1..=3)).unwrap();
        assert!(!f.orchestrator.try_to_go_live().unwrap());
        assert_eq!(f.node.current_state(), NodeState::CatchingUp);
        f.orchestrator.shutdown();
    }

    #[test]
    fn test_isolated_command_applied() {
        let f = fixture();
        let drop = OperationRecord::command(
            1,
            "app.users",
            CommandKind::Other {
                name: "drop".to_string(),
            },
        );
        f.orchestrator
            .apply_batch(Batch::from_records(vec![drop]))
            .unwrap();
        assert_eq!(f.storage.commands(), vec![(1, "drop".to_string())]);
        f.orchestrator.shutdown();
    }
}
