//! Apply metrics sink
//!
//! Counters only, monotonic, relaxed atomics. One instance is created by
//! whoever wires the engine and passed to the orchestrator and worker pool.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Apply engine counters
#[derive(Debug, Default)]
pub struct ApplyMetrics {
    ops_applied: AtomicU64,
    batches_applied: AtomicU64,
    batch_ops_total: AtomicU64,
    batch_apply_micros: AtomicU64,
    attempts_to_become_caught_up: AtomicU64,
    idempotent_errors_ignored: AtomicU64,
    missing_documents_fetched: AtomicU64,
}

impl ApplyMetrics {
    /// Create a sink with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one record applied by a worker
    pub fn increment_ops_applied(&self) {
        self.ops_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one finished batch of `ops` records taking `micros`
    pub fn record_batch(&self, ops: usize, micros: u64) {
        self.batches_applied.fetch_add(1, Ordering::Relaxed);
        self.batch_ops_total.fetch_add(ops as u64, Ordering::Relaxed);
        self.batch_apply_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Count one caught-up transition attempt
    pub fn increment_caught_up_attempts(&self) {
        self.attempts_to_become_caught_up
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count one failure absorbed as idempotent
    pub fn increment_idempotent_errors(&self) {
        self.idempotent_errors_ignored.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one missing document fetched and inserted
    pub fn increment_missing_documents(&self) {
        self.missing_documents_fetched
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Records applied so far
    pub fn ops_applied(&self) -> u64 {
        self.ops_applied.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ops_applied: self.ops_applied.load(Ordering::Relaxed),
            batches_applied: self.batches_applied.load(Ordering::Relaxed),
            batch_ops_total: self.batch_ops_total.load(Ordering::Relaxed),
            batch_apply_micros: self.batch_apply_micros.load(Ordering::Relaxed),
            attempts_to_become_caught_up: self
                .attempts_to_become_caught_up
                .load(Ordering::Relaxed),
            idempotent_errors_ignored: self.idempotent_errors_ignored.load(Ordering::Relaxed),
            missing_documents_fetched: self.missing_documents_fetched.load(Ordering::Relaxed),
        }
    }

    /// Counters as a JSON object
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

/// A point-in-time snapshot of all counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub ops_applied: u64,
    pub batches_applied: u64,
    pub batch_ops_total: u64,
    pub batch_apply_micros: u64,
    pub attempts_to_become_caught_up: u64,
    pub idempotent_errors_ignored: u64,
    pub missing_documents_fetched: u64,
}
