//! Log source abstraction
//!
//! The log source is the durable FIFO of committed records fetched from the
//! leader. The apply engine only peeks, pops and waits; it never writes.
//! Order must match commit order.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::record::OperationRecord;

/// Ordered queue of records produced by the fetcher.
pub trait LogSource: Send + Sync {
    /// Next record without removing it.
    fn peek(&self) -> Option<OperationRecord>;

    /// Remove and return the next record.
    fn try_pop(&self) -> Option<OperationRecord>;

    /// Block until a record is available or `timeout` elapses.
    ///
    /// Returns whether data is available.
    fn wait_for_data(&self, timeout: Duration) -> bool;
}

/// In-memory log source.
#[derive(Debug, Default)]
pub struct MemoryLogSource {
    queue: Mutex<VecDeque<OperationRecord>>,
    available: Condvar,
}

impl MemoryLogSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source preloaded with `records`.
    pub fn from_records(records: impl IntoIterator<Item = OperationRecord>) -> Self {
        Self {
            queue: Mutex::new(records.into_iter().collect()),
            available: Condvar::new(),
        }
    }

    /// Append a record and wake any waiter.
    pub fn push(&self, record: OperationRecord) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(record);
        self.available.notify_all();
    }

    /// Number of queued records.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSource for MemoryLogSource {
    fn peek(&self) -> Option<OperationRecord> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .front()
            .cloned()
    }

    fn try_pop(&self) -> Option<OperationRecord> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn wait_for_data(&self, timeout: Duration) -> bool {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let (queue, _) = self
            .available
            .wait_timeout_while(queue, timeout, |q| q.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        !queue.is_empty()
    }
}
