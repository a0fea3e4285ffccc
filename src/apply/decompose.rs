//! Container expansion
//!
//! Two kinds of container record are expanded into the records they stand
//! for:
//! - atomic multi-op commands (`ApplyOps`), whose payload lists the
//!   sub-operations in order
//! - transaction commits, whose members are reached through the
//!   previous-record chain, the newest of them possibly still batch-resident
//!
//! Every produced record is stamped with the container's OpTime and wall
//! time. Expansion is one level deep; nested containers come back out as
//! container records and the partitioner feeds them in again.

use serde::Deserialize;
use serde_json::Value;

use super::errors::{ApplyError, ApplyResult};
use crate::oplog::{LocalOplog, OpKind, OperationRecord, OpTime};

#[derive(Debug, Deserialize)]
struct ApplyOpsPayload {
    ops: Vec<SubOperation>,
}

#[derive(Debug, Deserialize)]
struct SubOperation {
    namespace: String,
    #[serde(flatten)]
    kind: OpKind,
    #[serde(default)]
    doc_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Parse the sub-operations of an `ApplyOps` record, in listed order.
///
/// Sub-operations are not restamped; callers stamp them with the commit
/// record they are attributed to.
pub fn parse_apply_ops(container: &OperationRecord) -> ApplyResult<Vec<OperationRecord>> {
    let parsed: ApplyOpsPayload =
        serde_json::from_value(container.payload.clone()).map_err(|e| {
            ApplyError::malformed_container(format!("cannot parse apply_ops payload: {}", e))
                .with_context(container.describe())
        })?;

    Ok(parsed
        .ops
        .into_iter()
        .map(|sub| {
            let mut record = OperationRecord::new(
                container.op_time,
                container.wall_time,
                sub.namespace,
                sub.kind,
            );
            record.doc_id = sub.doc_id;
            record.payload = sub.payload;
            record
        })
        .collect())
}

/// Expands container records against the follower's local log.
pub struct Decomposer<'a> {
    oplog: &'a dyn LocalOplog,
}

impl<'a> Decomposer<'a> {
    /// Create a decomposer walking chains in `oplog`.
    pub fn new(oplog: &'a dyn LocalOplog) -> Self {
        Self { oplog }
    }

    /// Expand an `ApplyOps` record, stamping every sub-operation with it.
    pub fn expand_apply_ops(&self, container: &OperationRecord) -> ApplyResult<Vec<OperationRecord>> {
        Ok(parse_apply_ops(container)?
            .iter()
            .map(|sub| sub.restamped_at(container))
            .collect())
    }

    /// Members of the transaction ending at `terminal` (a commit or a
    /// prepare), oldest first, stamped with `terminal`.
    ///
    /// `cached` holds members from the current batch in arrival order; the
    /// rest are found by walking the previous-record chain backwards from
    /// the oldest cached member (or from `terminal` when none are cached).
    pub fn decompose_transaction(
        &self,
        terminal: &OperationRecord,
        cached: &[OperationRecord],
    ) -> ApplyResult<Vec<OperationRecord>> {
        let chain_start = match cached.first() {
            Some(oldest) => oldest.prev_seq,
            None => terminal.prev_seq,
        };
        let chain_start = chain_start.filter(|seq| *seq != 0);

        if terminal.is_unprepared_commit() && cached.is_empty() && chain_start.is_none() {
            return Err(ApplyError::empty_transaction(format!(
                "commit at {} has no transaction members",
                terminal.op_time
            ))
            .with_context(terminal.describe()));
        }

        let upper = cached
            .first()
            .map(|r| r.op_time)
            .unwrap_or(terminal.op_time);
        let mut on_disk = self.walk_chain(terminal, chain_start, upper)?;
        on_disk.reverse();

        let mut members = Vec::new();
        for member in on_disk.iter().chain(cached.iter()) {
            self.extract_member(member, terminal, &mut members)?;
        }
        Ok(members)
    }

    /// Members of a prepared transaction committed by `commit`.
    ///
    /// The commit's chain link names the prepare record; its members are
    /// stamped with the commit. An empty prepare yields nothing.
    pub fn decompose_prepared_commit(
        &self,
        commit: &OperationRecord,
    ) -> ApplyResult<Vec<OperationRecord>> {
        let prepare_seq = commit.prev_seq.ok_or_else(|| {
            ApplyError::broken_chain("prepared commit has no link to its prepare record")
                .with_context(commit.describe())
        })?;
        let prepare = self.oplog.find(prepare_seq).ok_or_else(|| {
            ApplyError::broken_chain(format!(
                "prepare record {} not found in local log",
                prepare_seq
            ))
            .with_context(commit.describe())
        })?;
        if !prepare.is_prepare() {
            return Err(ApplyError::broken_chain(format!(
                "record {} linked from prepared commit is not a prepare",
                prepare_seq
            ))
            .with_context(commit.describe()));
        }

        Ok(self
            .decompose_transaction(&prepare, &[])?
            .iter()
            .map(|member| member.restamped_at(commit))
            .collect())
    }

    /// Newest-first members reachable from `start`.
    fn walk_chain(
        &self,
        terminal: &OperationRecord,
        start: Option<u64>,
        upper: OpTime,
    ) -> ApplyResult<Vec<OperationRecord>> {
        let mut found = Vec::new();
        let mut bound = upper.seq;
        let mut next = start;

        while let Some(seq) = next {
            if seq >= bound {
                return Err(ApplyError::broken_chain(format!(
                    "chain link {} does not precede {}",
                    seq, bound
                ))
                .with_context(terminal.describe()));
            }
            let member = self.oplog.find(seq).ok_or_else(|| {
                ApplyError::broken_chain(format!("transaction member {} not in local log", seq))
                    .with_context(terminal.describe())
            })?;
            if !member.is_partial_txn_member()
                || member.session_id() != terminal.session_id()
                || member.txn_number() != terminal.txn_number()
            {
                return Err(ApplyError::broken_chain(format!(
                    "record {} is not a member of this transaction",
                    seq
                ))
                .with_context(member.describe()));
            }
            bound = seq;
            next = member.prev_seq.filter(|s| *s != 0);
            found.push(member);
        }
        Ok(found)
    }

    fn extract_member(
        &self,
        member: &OperationRecord,
        terminal: &OperationRecord,
        out: &mut Vec<OperationRecord>,
    ) -> ApplyResult<()> {
        if member.is_apply_ops() {
            for sub in parse_apply_ops(member)? {
                out.push(sub.restamped_at(terminal));
            }
        } else {
            out.push(member.restamped_at(terminal));
        }
        Ok(())
    }
}
