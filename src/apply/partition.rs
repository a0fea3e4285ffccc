//! Lane assignment
//!
//! Every record of a batch, plus everything derived from it, is assigned to
//! one of N writer lanes. The lane is a hash of the namespace, with the
//! document id folded in when storage locks per document and the namespace
//! is not capped. Same-document records therefore share a lane and keep
//! their relative order.
//!
//! Containers and session bookkeeping are expanded with an explicit
//! depth-first work stack: a container's records are assigned before the
//! batch records that follow it, and nesting depth is bounded.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use super::decompose::Decomposer;
use super::errors::{ApplyError, ApplyResult};
use super::session::SessionTracker;
use crate::oplog::{LocalOplog, OpKind, OperationRecord};
use crate::storage::{ApplyMode, StorageEngine};

/// One worker's ordered share of a batch.
///
/// Lanes index into a record arena shared by every lane of the batch; the
/// arena is never mutated once lanes are built.
#[derive(Debug, Clone)]
pub struct WriterLane {
    id: usize,
    arena: Arc<Vec<OperationRecord>>,
    indices: Vec<usize>,
}

impl WriterLane {
    /// Lane index in `[0, N)`.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of records in the lane.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether the lane has no records.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Records in application order.
    pub fn records(&self) -> impl Iterator<Item = &OperationRecord> + '_ {
        self.indices.iter().map(move |i| &self.arena[*i])
    }
}

struct Frame {
    records: std::vec::IntoIter<OperationRecord>,
    depth: usize,
    track_sessions: bool,
}

impl Frame {
    fn new(records: Vec<OperationRecord>, depth: usize, track_sessions: bool) -> Self {
        Self {
            records: records.into_iter(),
            depth,
            track_sessions,
        }
    }
}

/// Assigns records to writer lanes.
#[derive(Debug, Clone)]
pub struct Partitioner {
    lane_count: usize,
    max_nesting_depth: usize,
    begin_applying_after: Option<u64>,
}

impl Partitioner {
    /// Create a partitioner for `lane_count` lanes (at least one).
    pub fn new(lane_count: usize, max_nesting_depth: usize) -> Self {
        Self {
            lane_count: lane_count.max(1),
            max_nesting_depth,
            begin_applying_after: None,
        }
    }

    /// Skip records at or below `seq`.
    pub fn with_begin_applying_after(mut self, seq: u64) -> Self {
        self.begin_applying_after = Some(seq);
        self
    }

    /// Number of lanes.
    pub fn lane_count(&self) -> usize {
        self.lane_count
    }

    /// Lane of `record`.
    ///
    /// `fold_document` is whether the document id takes part in the hash.
    pub fn lane_for(&self, record: &OperationRecord, fold_document: bool) -> usize {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(record.namespace.as_bytes());
        if fold_document && record.is_crud() {
            if let Some(doc_id) = record.doc_id.as_deref() {
                hasher.update(&[0]);
                hasher.update(doc_id.as_bytes());
            }
        }
        hasher.finalize() as usize % self.lane_count
    }

    /// Expand and assign every record of a batch.
    ///
    /// Returns exactly `lane_count` lanes, some possibly empty.
    pub fn partition(
        &self,
        records: Vec<OperationRecord>,
        oplog: &dyn LocalOplog,
        storage: &dyn StorageEngine,
        mode: ApplyMode,
    ) -> ApplyResult<Vec<WriterLane>> {
        let decomposer = Decomposer::new(oplog);
        let mut sessions = SessionTracker::new();
        let mut pending_txns: HashMap<Uuid, Vec<OperationRecord>> = HashMap::new();
        let mut capped: HashMap<String, bool> = HashMap::new();
        let document_locking = storage.supports_document_locking();

        let mut arena: Vec<OperationRecord> = Vec::with_capacity(records.len());
        let mut lanes: Vec<Vec<usize>> = vec![Vec::new(); self.lane_count];

        let mut stack = vec![Frame::new(records, 0, true)];
        let mut flushed = false;

        loop {
            let Some(frame) = stack.last_mut() else {
                if flushed {
                    break;
                }
                // Session rows not yet surfaced go at the end of the batch
                flushed = true;
                let rows = sessions.flush();
                if !rows.is_empty() {
                    stack.push(Frame::new(rows, 0, false));
                }
                continue;
            };
            let depth = frame.depth;
            let track_sessions = frame.track_sessions;
            let Some(mut record) = frame.records.next() else {
                stack.pop();
                continue;
            };

            if let Some(after) = self.begin_applying_after {
                if record.seq() <= after {
                    continue;
                }
            }

            if track_sessions {
                if let Some(rows) = sessions.observe(&record) {
                    // Rows go first; the record is retried unobserved after them
                    stack.push(Frame::new(vec![record], depth, false));
                    stack.push(Frame::new(rows, depth, false));
                    continue;
                }
            }

            if record.is_partial_txn_member() {
                if let Some(session) = record.session.as_ref() {
                    let members = pending_txns.entry(session.session_id).or_default();
                    if members
                        .last()
                        .is_some_and(|m| m.txn_number() != Some(session.txn_number))
                    {
                        members.clear();
                    }
                    members.push(record);
                    continue;
                }
            }

            let expanded = if record.is_unprepared_commit() {
                let mut cached = record
                    .session_id()
                    .and_then(|id| pending_txns.remove(&id))
                    .unwrap_or_default();
                cached.retain(|m| m.txn_number() == record.txn_number());
                Some((decomposer.decompose_transaction(&record, &cached)?, false))
            } else if record.is_apply_ops() && !record.is_partial_txn_member() {
                Some((decomposer.expand_apply_ops(&record)?, track_sessions))
            } else if mode == ApplyMode::Recovering && record.is_prepared_commit() {
                Some((decomposer.decompose_prepared_commit(&record)?, false))
            } else {
                None
            };

            if let Some((derived, track)) = expanded {
                if depth + 1 > self.max_nesting_depth {
                    return Err(ApplyError::nesting_limit(format!(
                        "container nesting exceeds {} levels",
                        self.max_nesting_depth
                    ))
                    .with_context(record.describe()));
                }
                stack.push(Frame::new(derived, depth + 1, track));
                continue;
            }

            // Prepares are applied at their commit while recovering
            if mode == ApplyMode::Recovering && record.is_prepare() {
                continue;
            }

            let is_capped = *capped
                .entry(record.namespace.clone())
                .or_insert_with(|| storage.is_capped(&record.namespace));
            if is_capped && record.kind == OpKind::Insert {
                record.for_capped_collection = true;
            }

            let lane = self.lane_for(&record, document_locking && !is_capped);
            lanes[lane].push(arena.len());
            arena.push(record);
        }

        let arena = Arc::new(arena);
        Ok(lanes
            .into_iter()
            .enumerate()
            .map(|(id, indices)| WriterLane {
                id,
                arena: Arc::clone(&arena),
                indices,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::errors::ApplyErrorKind;
    use crate::oplog::{CommandKind, MemoryOplog, SESSION_TABLE_NAMESPACE};
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn lane_docs(lanes: &[WriterLane]) -> Vec<Vec<String>> {
        lanes
            .iter()
            .map(|l| l.records().filter_map(|r| r.doc_id.clone()).collect())
            .collect()
    }

    fn total(lanes: &[WriterLane]) -> usize {
        lanes.iter().map(WriterLane::len).sum()
    }

    #[test]
    fn test_same_document_same_lane() {
        let partitioner = Partitioner::new(8, 8);
        let a1 = OperationRecord::insert(1, "app.users", "alice");
        let a2 = OperationRecord::update(7, "app.users", "alice");
        assert_eq!(
            partitioner.lane_for(&a1, true),
            partitioner.lane_for(&a2, true)
        );
    }

    #[test]
    fn test_without_document_locking_namespace_decides() {
        let oplog = MemoryOplog::new();
        let storage = MemoryStorage::with_document_locking(false);
        let records: Vec<_> = (1..=20)
            .map(|i| OperationRecord::insert(i, "app.users", format!("d{}", i)))
            .collect();
        let lanes = Partitioner::new(4, 8)
            .partition(records, &oplog, &storage, ApplyMode::Steady)
            .unwrap();
        assert_eq!(lanes.iter().filter(|l| !l.is_empty()).count(), 1);
    }

    #[test]
    fn test_lanes_preserve_arrival_order() {
        let oplog = MemoryOplog::new();
        let storage = MemoryStorage::new();
        let records: Vec<_> = (1..=50)
            .map(|i| OperationRecord::insert(i, "app.users", format!("d{}", i % 5)))
            .collect();
        let lanes = Partitioner::new(3, 8)
            .partition(records, &oplog, &storage, ApplyMode::Steady)
            .unwrap();
        assert_eq!(lanes.len(), 3);
        assert_eq!(total(&lanes), 50);
        for lane in &lanes {
            let seqs: Vec<u64> = lane.records().map(|r| r.seq()).collect();
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_capped_inserts_flagged_and_not_dispersed() {
        let oplog = MemoryOplog::new();
        let storage = MemoryStorage::new();
        storage.create_namespace("app.log", true);
        let records: Vec<_> = (1..=10)
            .map(|i| OperationRecord::insert(i, "app.log", format!("e{}", i)))
            .collect();
        let lanes = Partitioner::new(4, 8)
            .partition(records, &oplog, &storage, ApplyMode::Steady)
            .unwrap();
        let used: Vec<_> = lanes.iter().filter(|l| !l.is_empty()).collect();
        assert_eq!(used.len(), 1);
        assert!(used[0].records().all(|r| r.for_capped_collection));
    }

    #[test]
    fn test_begin_applying_after_skips_prefix() {
        let oplog = MemoryOplog::new();
        let storage = MemoryStorage::new();
        let records: Vec<_> = (1..=6)
            .map(|i| OperationRecord::insert(i, "app.users", format!("d{}", i)))
            .collect();
        let lanes = Partitioner::new(2, 8)
            .with_begin_applying_after(4)
            .partition(records, &oplog, &storage, ApplyMode::InitialCatchup)
            .unwrap();
        assert_eq!(total(&lanes), 2);
    }

    #[test]
    fn test_apply_ops_expanded_in_place() {
        let oplog = MemoryOplog::new();
        let storage = MemoryStorage::with_document_locking(false);
        let records = vec![
            OperationRecord::insert(1, "app.a", "before"),
            OperationRecord::command(2, "admin.$cmd", CommandKind::ApplyOps).with_payload(json!({
                "ops": [
                    {"namespace": "app.a", "op": "insert", "doc_id": "inner1"},
                    {"namespace": "app.a", "op": "insert", "doc_id": "inner2"}
                ]
            })),
            OperationRecord::insert(3, "app.a", "after"),
        ];
        let lanes = Partitioner::new(1, 8)
            .partition(records, &oplog, &storage, ApplyMode::Steady)
            .unwrap();
        assert_eq!(
            lane_docs(&lanes)[0],
            vec!["before", "inner1", "inner2", "after"]
        );
    }

    #[test]
    fn test_nesting_limit_enforced() {
        let oplog = MemoryOplog::new();
        let storage = MemoryStorage::new();
        let mut payload = json!({"ops": [{"namespace": "app.a", "op": "insert", "doc_id": "x"}]});
        for _ in 0..3 {
            payload = json!({"ops": [
                {"namespace": "admin.$cmd", "op": "command", "command": "apply_ops", "payload": payload}
            ]});
        }
        let container =
            OperationRecord::command(1, "admin.$cmd", CommandKind::ApplyOps).with_payload(payload);

        let err = Partitioner::new(2, 2)
            .partition(vec![container.clone()], &oplog, &storage, ApplyMode::Steady)
            .unwrap_err();
        assert_eq!(err.kind, ApplyErrorKind::NestingLimitExceeded);

        let lanes = Partitioner::new(2, 4)
            .partition(vec![container], &oplog, &storage, ApplyMode::Steady)
            .unwrap();
        assert_eq!(total(&lanes), 1);
    }

    #[test]
    fn test_transaction_members_held_until_commit() {
        let oplog = MemoryOplog::new();
        let storage = MemoryStorage::with_document_locking(false);
        let session = Uuid::new_v4();
        let records = vec![
            OperationRecord::insert(5, "app.a", "m1")
                .with_session(session, 1)
                .as_partial_txn(),
            OperationRecord::insert(6, "app.a", "plain"),
            OperationRecord::insert(9, "app.a", "m2")
                .with_session(session, 1)
                .as_partial_txn()
                .with_prev(5),
            OperationRecord::command(
                12,
                "admin.$cmd",
                CommandKind::CommitTransaction { prepared: false },
            )
            .with_session(session, 1)
            .with_prev(9),
        ];
        let lanes = Partitioner::new(1, 8)
            .partition(records, &oplog, &storage, ApplyMode::Steady)
            .unwrap();

        let lane: Vec<&OperationRecord> = lanes[0].records().collect();
        let app: Vec<&str> = lane
            .iter()
            .filter(|r| r.namespace == "app.a")
            .filter_map(|r| r.doc_id.as_deref())
            .collect();
        assert_eq!(app, vec!["plain", "m1", "m2"]);
        assert!(lane
            .iter()
            .filter(|r| r.namespace == "app.a" && r.doc_id.as_deref() != Some("plain"))
            .all(|r| r.seq() == 12));
        assert!(lane.iter().any(|r| r.namespace == SESSION_TABLE_NAMESPACE));
    }

    #[test]
    fn test_new_txn_number_resets_pending_members() {
        let session = Uuid::new_v4();
        let oplog = MemoryOplog::new();
        let storage = MemoryStorage::with_document_locking(false);
        let records = vec![
            OperationRecord::insert(3, "app.a", "stale")
                .with_session(session, 1)
                .as_partial_txn(),
            OperationRecord::insert(4, "app.a", "fresh")
                .with_session(session, 2)
                .as_partial_txn(),
            OperationRecord::command(
                5,
                "admin.$cmd",
                CommandKind::CommitTransaction { prepared: false },
            )
            .with_session(session, 2)
            .with_prev(4),
        ];
        let lanes = Partitioner::new(1, 8)
            .partition(records, &oplog, &storage, ApplyMode::Steady)
            .unwrap();
        let app: Vec<String> = lanes[0]
            .records()
            .filter(|r| r.namespace == "app.a")
            .filter_map(|r| r.doc_id.clone())
            .collect();
        assert_eq!(app, vec!["fresh"]);
    }

    #[test]
    fn test_session_rows_flushed_at_end() {
        let oplog = MemoryOplog::new();
        let storage = MemoryStorage::with_document_locking(false);
        let session = Uuid::new_v4();
        let records = vec![
            OperationRecord::insert(1, "app.a", "x").with_session(session, 3),
            OperationRecord::insert(2, "app.b", "y"),
        ];
        let lanes = Partitioner::new(1, 8)
            .partition(records, &oplog, &storage, ApplyMode::Steady)
            .unwrap();
        let last = lanes[0].records().last().unwrap();
        assert_eq!(last.namespace, SESSION_TABLE_NAMESPACE);
        assert_eq!(last.seq(), 1);
    }

    #[test]
    fn test_recovering_applies_prepared_commit_members() {
        let session = Uuid::new_v4();
        let oplog = MemoryOplog::new();
        let member = OperationRecord::insert(7, "app.a", "p1")
            .with_session(session, 1)
            .as_partial_txn();
        let prepare = OperationRecord::command(10, "admin.$cmd", CommandKind::PrepareTransaction)
            .with_session(session, 1)
            .with_prev(7);
        let commit = OperationRecord::command(
            14,
            "admin.$cmd",
            CommandKind::CommitTransaction { prepared: true },
        )
        .with_session(session, 1)
        .with_prev(10);
        oplog
            .append(&[member.clone(), prepare.clone(), commit.clone()])
            .unwrap();

        let storage = MemoryStorage::new();
        let lanes = Partitioner::new(2, 8)
            .partition(vec![prepare, commit], &oplog, &storage, ApplyMode::Recovering)
            .unwrap();
        let applied: Vec<&OperationRecord> = lanes.iter().flat_map(|l| l.records()).collect();
        assert!(applied.iter().all(|r| !r.is_command()));
        assert!(applied
            .iter()
            .any(|r| r.doc_id.as_deref() == Some("p1") && r.seq() == 14));
    }
}
