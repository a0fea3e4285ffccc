//! The follower's own durable log
//!
//! Every applied batch is first appended here. Transaction commits reach
//! their earlier members by walking previous-record links through this log,
//! and crash recovery truncates its partially written tail and replays what
//! lies past applied-through.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::record::OperationRecord;

/// Local log surface used by the apply engine.
pub trait LocalOplog: Send + Sync {
    /// Append records in order. Durable on return.
    fn append(&self, records: &[OperationRecord]) -> std::io::Result<()>;

    /// Look up the record at `seq`.
    fn find(&self, seq: u64) -> Option<OperationRecord>;

    /// Remove every record with sequence number >= `seq`.
    ///
    /// Returns the number of removed records.
    fn truncate_from(&self, seq: u64) -> std::io::Result<usize>;

    /// Records with sequence number > `seq`, oldest first.
    fn records_after(&self, seq: u64) -> Vec<OperationRecord>;

    /// Highest sequence number present.
    fn last_seq(&self) -> Option<u64>;
}

/// In-memory local log keyed by sequence number.
#[derive(Debug, Default)]
pub struct MemoryOplog {
    records: RwLock<BTreeMap<u64, OperationRecord>>,
}

impl MemoryOplog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocalOplog for MemoryOplog {
    fn append(&self, records: &[OperationRecord]) -> std::io::Result<()> {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        for record in records {
            map.insert(record.seq(), record.clone());
        }
        Ok(())
    }

    fn find(&self, seq: u64) -> Option<OperationRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&seq)
            .cloned()
    }

    fn truncate_from(&self, seq: u64) -> std::io::Result<usize> {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        let tail = map.split_off(&seq);
        Ok(tail.len())
    }

    fn records_after(&self, seq: u64) -> Vec<OperationRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .range(seq.saturating_add(1)..)
            .map(|(_, r)| r.clone())
            .collect()
    }

    fn last_seq(&self) -> Option<u64> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .next_back()
            .copied()
    }
}
