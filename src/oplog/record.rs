//! Operation record types
//!
//! An operation record is the atomic unit of replication. Records are
//! immutable once observed from the log source; the apply engine only ever
//! derives new records from them (container expansion, session bookkeeping).
//!
//! Every record carries:
//! - OpTime (logical sequence number + leader term)
//! - Wall-clock timestamp
//! - Target namespace
//! - Operation kind and payload
//! - Optional document id, session info and previous-record link

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Namespace holding per-session progress rows.
pub const SESSION_TABLE_NAMESPACE: &str = "config.transactions";

/// Namespace holding the server configuration document.
pub const SERVER_CONFIGURATION_NAMESPACE: &str = "admin.system.version";

/// Fixed per-record overhead used when sizing batches.
const RECORD_OVERHEAD_BYTES: usize = 64;

/// Position of a record in the replicated log.
///
/// Ordering is by logical sequence number first. The sequence number is
/// globally unique, so the term never decides a comparison between two
/// distinct log positions.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpTime {
    /// Logical sequence number
    pub seq: u64,
    /// Leader term at commit time
    #[serde(default)]
    pub term: u64,
}

impl OpTime {
    /// Create a new OpTime.
    pub fn new(seq: u64, term: u64) -> Self {
        Self { seq, term }
    }

    /// The null OpTime, ordered before every real log position.
    pub fn null() -> Self {
        Self::default()
    }

    /// Whether this is the null OpTime.
    pub fn is_null(&self) -> bool {
        self.seq == 0
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{seq: {}, term: {}}}", self.seq, self.term)
    }
}

/// Command flavours the apply engine distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandKind {
    /// Atomic multi-op container; payload lists the sub-operations
    ApplyOps,
    /// Transaction commit
    CommitTransaction {
        /// Whether the transaction was prepared before commit
        #[serde(default)]
        prepared: bool,
    },
    /// Transaction prepare; members are reachable through the chain link
    PrepareTransaction,
    /// Transaction abort
    AbortTransaction,
    /// Any other command (catalog changes, drops, renames, ...)
    Other {
        /// Command name
        name: String,
    },
}

/// Operation kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpKind {
    /// Document insert
    Insert,
    /// Document update
    Update,
    /// Document delete
    Delete,
    /// Command
    Command(CommandKind),
    /// No-op (heartbeats, migration markers)
    Noop,
}

impl OpKind {
    /// Short name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Command(_) => "command",
            OpKind::Noop => "noop",
        }
    }
}

/// Session and transaction identity of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Logical session id
    pub session_id: Uuid,
    /// Transaction number (operation epoch) within the session
    pub txn_number: u64,
    /// Member of a multi-record transaction that has not committed yet
    #[serde(default)]
    pub partial_txn: bool,
}

/// A single logged mutation or command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Log position
    pub op_time: OpTime,
    /// Wall-clock time at commit on the leader
    pub wall_time: DateTime<Utc>,
    /// Target namespace (`db.collection`)
    pub namespace: String,
    /// Operation kind
    #[serde(flatten)]
    pub kind: OpKind,
    /// Operation body
    #[serde(default)]
    pub payload: Value,
    /// Target document identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    /// Session identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    /// Sequence number of the previous record in the same transaction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_seq: Option<u64>,
    /// Set by the partitioner for inserts into capped namespaces
    #[serde(skip)]
    pub for_capped_collection: bool,
}

impl OperationRecord {
    /// Create a record with an empty payload and no session.
    pub fn new(op_time: OpTime, wall_time: DateTime<Utc>, namespace: impl Into<String>, kind: OpKind) -> Self {
        Self {
            op_time,
            wall_time,
            namespace: namespace.into(),
            kind,
            payload: Value::Null,
            doc_id: None,
            session: None,
            prev_seq: None,
            for_capped_collection: false,
        }
    }

    /// Insert of `doc_id` into `namespace` at `seq`, term 1.
    pub fn insert(seq: u64, namespace: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self::new(OpTime::new(seq, 1), Utc::now(), namespace, OpKind::Insert).with_doc_id(doc_id)
    }

    /// Update of `doc_id` in `namespace` at `seq`, term 1.
    pub fn update(seq: u64, namespace: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self::new(OpTime::new(seq, 1), Utc::now(), namespace, OpKind::Update).with_doc_id(doc_id)
    }

    /// Delete of `doc_id` from `namespace` at `seq`, term 1.
    pub fn delete(seq: u64, namespace: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self::new(OpTime::new(seq, 1), Utc::now(), namespace, OpKind::Delete).with_doc_id(doc_id)
    }

    /// Command on `namespace` at `seq`, term 1.
    pub fn command(seq: u64, namespace: impl Into<String>, command: CommandKind) -> Self {
        Self::new(OpTime::new(seq, 1), Utc::now(), namespace, OpKind::Command(command))
    }

    /// No-op at `seq`, term 1.
    pub fn noop(seq: u64) -> Self {
        Self::new(OpTime::new(seq, 1), Utc::now(), "", OpKind::Noop)
    }

    /// Set the document id.
    pub fn with_doc_id(mut self, doc_id: impl Into<String>) -> Self {
        self.doc_id = Some(doc_id.into());
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the session identity.
    pub fn with_session(mut self, session_id: Uuid, txn_number: u64) -> Self {
        self.session = Some(SessionInfo {
            session_id,
            txn_number,
            partial_txn: false,
        });
        self
    }

    /// Mark as a member of a not-yet-committed multi-record transaction.
    pub fn as_partial_txn(mut self) -> Self {
        if let Some(session) = self.session.as_mut() {
            session.partial_txn = true;
        }
        self
    }

    /// Set the previous-record link.
    pub fn with_prev(mut self, prev_seq: u64) -> Self {
        self.prev_seq = Some(prev_seq);
        self
    }

    /// Set the wall-clock time.
    pub fn at(mut self, wall_time: DateTime<Utc>) -> Self {
        self.wall_time = wall_time;
        self
    }

    /// Logical sequence number.
    pub fn seq(&self) -> u64 {
        self.op_time.seq
    }

    /// Session id, if any.
    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.session_id)
    }

    /// Transaction number, if any.
    pub fn txn_number(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.txn_number)
    }

    /// Insert, update or delete.
    pub fn is_crud(&self) -> bool {
        matches!(self.kind, OpKind::Insert | OpKind::Update | OpKind::Delete)
    }

    /// Command record.
    pub fn is_command(&self) -> bool {
        matches!(self.kind, OpKind::Command(_))
    }

    /// Command kind, if this is a command.
    pub fn command_kind(&self) -> Option<&CommandKind> {
        match &self.kind {
            OpKind::Command(command) => Some(command),
            _ => None,
        }
    }

    /// Member of a transaction whose commit has not been observed yet.
    pub fn is_partial_txn_member(&self) -> bool {
        self.session.as_ref().map(|s| s.partial_txn).unwrap_or(false)
    }

    /// Atomic multi-op container.
    pub fn is_apply_ops(&self) -> bool {
        matches!(self.command_kind(), Some(CommandKind::ApplyOps))
    }

    /// Commit of a transaction that was never prepared.
    pub fn is_unprepared_commit(&self) -> bool {
        matches!(
            self.command_kind(),
            Some(CommandKind::CommitTransaction { prepared: false })
        )
    }

    /// Commit of a prepared transaction.
    pub fn is_prepared_commit(&self) -> bool {
        matches!(
            self.command_kind(),
            Some(CommandKind::CommitTransaction { prepared: true })
        )
    }

    /// Transaction prepare.
    pub fn is_prepare(&self) -> bool {
        matches!(self.command_kind(), Some(CommandKind::PrepareTransaction))
    }

    /// Whether this record must be applied in a batch of its own.
    ///
    /// Commands are isolated except the two container kinds, which expand to
    /// CRUD operations. The view catalog and the server configuration document
    /// change shared state immediately, so their writes are isolated too.
    pub fn must_apply_alone(&self) -> bool {
        if self.is_command() && !self.is_apply_ops() && !self.is_unprepared_commit() {
            return true;
        }
        is_view_catalog(&self.namespace) || is_server_configuration(&self.namespace)
    }

    /// Approximate encoded size, used for the batch byte budget.
    pub fn size_bytes(&self) -> usize {
        let payload_len = serde_json::to_vec(&self.payload)
            .map(|bytes| bytes.len())
            .unwrap_or(0);
        RECORD_OVERHEAD_BYTES
            + self.namespace.len()
            + self.doc_id.as_ref().map(|id| id.len()).unwrap_or(0)
            + payload_len
    }

    /// Copy of this record as if it were committed at `commit`.
    ///
    /// Position, term and wall time are taken from the commit record so
    /// downstream bookkeeping attributes the write to the commit point.
    /// The copy is no longer a pending transaction member.
    pub fn restamped_at(&self, commit: &OperationRecord) -> OperationRecord {
        let mut record = self.clone();
        record.op_time = commit.op_time;
        record.wall_time = commit.wall_time;
        if record.session.is_none() {
            record.session = commit.session.clone();
        }
        if let Some(session) = record.session.as_mut() {
            session.partial_txn = false;
        }
        record.prev_seq = None;
        record
    }

    /// One-line rendering used in fatal error context.
    pub fn describe(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{op: {}, ns: {}, op_time: {}}}",
                self.kind.as_str(),
                self.namespace,
                self.op_time
            )
        })
    }
}

/// Whether `namespace` is a view catalog.
pub fn is_view_catalog(namespace: &str) -> bool {
    namespace.ends_with(".system.views")
}

/// Whether `namespace` is the server configuration collection.
pub fn is_server_configuration(namespace: &str) -> bool {
    namespace == SERVER_CONFIGURATION_NAMESPACE
}
