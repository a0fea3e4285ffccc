//! Batches of operation records
//!
//! A batch is built by the batcher, handed to the orchestrator exactly once,
//! and then consumed. A batch may instead carry the must-shut-down flag, in
//! which case it is empty and terminates the apply loop.

use super::record::{OpTime, OperationRecord};

/// An ordered run of records drawn from one batcher pass.
#[derive(Debug, Default)]
pub struct Batch {
    records: Vec<OperationRecord>,
    bytes: usize,
    must_shutdown: bool,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty batch with room for `records` entries.
    pub fn with_capacity(records: usize) -> Self {
        Self {
            records: Vec::with_capacity(records),
            bytes: 0,
            must_shutdown: false,
        }
    }

    /// Build a batch from already-ordered records.
    pub fn from_records(records: Vec<OperationRecord>) -> Self {
        let bytes = records.iter().map(OperationRecord::size_bytes).sum();
        Self {
            records,
            bytes,
            must_shutdown: false,
        }
    }

    /// The terminal batch that tells the orchestrator to exit.
    pub fn shutdown_marker() -> Self {
        Self {
            records: Vec::new(),
            bytes: 0,
            must_shutdown: true,
        }
    }

    /// Append a record.
    pub fn push(&mut self, record: OperationRecord) {
        self.bytes += record.size_bytes();
        self.records.push(record);
    }

    /// Set the must-shut-down flag.
    pub fn set_must_shutdown(&mut self) {
        self.must_shutdown = true;
    }

    /// Whether the apply loop must exit after this batch.
    pub fn must_shutdown(&self) -> bool {
        self.must_shutdown
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Aggregate size in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Records in order.
    pub fn records(&self) -> &[OperationRecord] {
        &self.records
    }

    /// OpTime of the first record.
    pub fn first_op_time(&self) -> Option<OpTime> {
        self.records.first().map(|r| r.op_time)
    }

    /// OpTime of the last record.
    pub fn last_op_time(&self) -> Option<OpTime> {
        self.records.last().map(|r| r.op_time)
    }

    /// Release the records, consuming the batch.
    pub fn into_records(self) -> Vec<OperationRecord> {
        self.records
    }
}
