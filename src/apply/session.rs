//! Session progress tracking
//!
//! Writes made under a session (retryable writes, transactions) advance
//! that session's row in the session table. The tracker accumulates the
//! latest progress per session in memory and materializes session-table
//! records only when they must become visible:
//! - a transaction changes state (commit, prepare, abort)
//! - the session table itself is written or targeted by a command
//! - the end of the batch (`flush`)

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::oplog::{CommandKind, OpKind, OpTime, OperationRecord, SESSION_TABLE_NAMESPACE};

#[derive(Debug, Clone)]
struct SessionProgress {
    txn_number: u64,
    op_time: OpTime,
    wall_time: DateTime<Utc>,
}

/// Accumulates per-session progress across one batch.
#[derive(Debug, Default)]
pub struct SessionTracker {
    pending: HashMap<Uuid, SessionProgress>,
}

impl SessionTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions with progress not yet materialized.
    pub fn pending_sessions(&self) -> usize {
        self.pending.len()
    }

    /// Observe one record.
    ///
    /// Returns the session-table records that must be applied before
    /// `record`, if any.
    pub fn observe(&mut self, record: &OperationRecord) -> Option<Vec<OperationRecord>> {
        if let Some(state) = transaction_state(record) {
            let session = record.session.as_ref()?;
            // Superseded by the transaction's own row
            self.pending.remove(&session.session_id);
            return Some(vec![session_row(
                session.session_id,
                session.txn_number,
                record.op_time,
                record.wall_time,
                state,
            )]);
        }

        if record.namespace == SESSION_TABLE_NAMESPACE {
            if record.is_command() {
                return self.flush_nonempty();
            }
            let session_id = record.doc_id.as_deref().and_then(|id| Uuid::parse_str(id).ok());
            return session_id.and_then(|id| {
                self.pending
                    .remove(&id)
                    .map(|progress| vec![progress_row(id, &progress)])
            });
        }
        if record.is_command() && record.namespace.starts_with("config.") {
            return self.flush_nonempty();
        }

        if let Some(session) = record.session.as_ref() {
            if record.is_partial_txn_member() {
                return None;
            }
            let replace = match self.pending.get(&session.session_id) {
                Some(existing) => {
                    session.txn_number > existing.txn_number
                        || (session.txn_number == existing.txn_number
                            && record.op_time > existing.op_time)
                }
                None => true,
            };
            if replace {
                self.pending.insert(
                    session.session_id,
                    SessionProgress {
                        txn_number: session.txn_number,
                        op_time: record.op_time,
                        wall_time: record.wall_time,
                    },
                );
            }
        }
        None
    }

    /// Materialize every pending session row, oldest progress first.
    pub fn flush(&mut self) -> Vec<OperationRecord> {
        let mut rows: Vec<(Uuid, SessionProgress)> = self.pending.drain().collect();
        rows.sort_by(|a, b| a.1.op_time.cmp(&b.1.op_time).then(a.0.cmp(&b.0)));
        rows.iter()
            .map(|(id, progress)| progress_row(*id, progress))
            .collect()
    }

    fn flush_nonempty(&mut self) -> Option<Vec<OperationRecord>> {
        let rows = self.flush();
        if rows.is_empty() {
            None
        } else {
            Some(rows)
        }
    }
}

fn transaction_state(record: &OperationRecord) -> Option<&'static str> {
    let OpKind::Command(command) = &record.kind else {
        return None;
    };
    record.session.as_ref()?;
    match command {
        CommandKind::CommitTransaction { .. } => Some("committed"),
        CommandKind::PrepareTransaction => Some("prepared"),
        CommandKind::AbortTransaction => Some("aborted"),
        CommandKind::ApplyOps if !record.is_partial_txn_member() => Some("committed"),
        _ => None,
    }
}

fn progress_row(session_id: Uuid, progress: &SessionProgress) -> OperationRecord {
    session_row(
        session_id,
        progress.txn_number,
        progress.op_time,
        progress.wall_time,
        "",
    )
}

fn session_row(
    session_id: Uuid,
    txn_number: u64,
    op_time: OpTime,
    wall_time: DateTime<Utc>,
    state: &str,
) -> OperationRecord {
    let mut payload = json!({
        "session_id": session_id.to_string(),
        "txn_number": txn_number,
        "last_write_op_time": op_time,
        "last_write_date": wall_time,
    });
    if !state.is_empty() {
        payload["state"] = json!(state);
    }
    OperationRecord::new(op_time, wall_time, SESSION_TABLE_NAMESPACE, OpKind::Insert)
        .with_doc_id(session_id.to_string())
        .with_payload(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(seq: u64, session: Uuid, txn: u64) -> OperationRecord {
        OperationRecord::insert(seq, "app.orders", format!("o{}", seq)).with_session(session, txn)
    }

    #[test]
    fn test_plain_writes_accumulate_until_flush() {
        let mut tracker = SessionTracker::new();
        let session = Uuid::new_v4();
        assert!(tracker.observe(&write(1, session, 1)).is_none());
        assert!(tracker.observe(&write(2, session, 2)).is_none());
        assert!(tracker
            .observe(&OperationRecord::insert(3, "app.orders", "x"))
            .is_none());

        let rows = tracker.flush();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].namespace, SESSION_TABLE_NAMESPACE);
        assert_eq!(rows[0].doc_id, Some(session.to_string()));
        assert_eq!(rows[0].op_time.seq, 2);
        assert_eq!(rows[0].payload["txn_number"], 2);
        assert!(tracker.flush().is_empty());
    }

    #[test]
    fn test_older_txn_number_does_not_regress() {
        let mut tracker = SessionTracker::new();
        let session = Uuid::new_v4();
        tracker.observe(&write(5, session, 4));
        tracker.observe(&write(6, session, 3));
        let rows = tracker.flush();
        assert_eq!(rows[0].payload["txn_number"], 4);
    }

    #[test]
    fn test_commit_materializes_immediately() {
        let mut tracker = SessionTracker::new();
        let session = Uuid::new_v4();
        tracker.observe(&write(1, session, 7));
        let commit = OperationRecord::command(
            4,
            "admin.$cmd",
            CommandKind::CommitTransaction { prepared: false },
        )
        .with_session(session, 8);

        let rows = tracker.observe(&commit).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload["state"], "committed");
        assert_eq!(rows[0].op_time, commit.op_time);
        assert_eq!(tracker.pending_sessions(), 0);
    }

    #[test]
    fn test_partial_members_are_not_tracked() {
        let mut tracker = SessionTracker::new();
        let member = write(1, Uuid::new_v4(), 1).as_partial_txn();
        assert!(tracker.observe(&member).is_none());
        assert_eq!(tracker.pending_sessions(), 0);
    }

    #[test]
    fn test_direct_session_table_write_flushes_that_session() {
        let mut tracker = SessionTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.observe(&write(1, a, 1));
        tracker.observe(&write(2, b, 1));

        let direct = OperationRecord::update(3, SESSION_TABLE_NAMESPACE, a.to_string());
        let rows = tracker.observe(&direct).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].doc_id, Some(a.to_string()));
        assert_eq!(tracker.pending_sessions(), 1);
    }

    #[test]
    fn test_config_command_flushes_everything() {
        let mut tracker = SessionTracker::new();
        tracker.observe(&write(1, Uuid::new_v4(), 1));
        tracker.observe(&write(2, Uuid::new_v4(), 1));
        let drop = OperationRecord::command(
            3,
            SESSION_TABLE_NAMESPACE,
            CommandKind::Other {
                name: "drop".to_string(),
            },
        );
        let rows = tracker.observe(&drop).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].op_time < rows[1].op_time);
    }
}
