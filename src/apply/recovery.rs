//! Startup recovery
//!
//! Runs before the batcher starts:
//! 1. Seed this member's applied position from applied-through
//! 2. If a truncate-after point survived a crash, discard the local log
//!    from it onward and clear the point
//! 3. Replay local log records past applied-through in recovering mode
//!
//! Replay goes through the same partitioning and worker pool as steady
//! state, so recovered state matches what an uninterrupted run produces.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::batcher::{fill_batch, BatchLimits, SystemClock};
use super::config::ApplierConfig;
use super::errors::{ApplyError, ApplyResult};
use super::finalizer::SyncFinalizer;
use super::orchestrator::{Collaborators, Orchestrator};
use crate::observability::{log_event, Event, ObservationScope};
use crate::oplog::{LocalOplog, MemoryLogSource, OpTime, OperationRecord};
use crate::progress::{AppliedPosition, DataConsistency, ProgressStore};
use crate::storage::ApplyMode;

/// Outcome of startup recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Local log records discarded past the truncate-after point
    pub truncated: usize,
    /// Local log records replayed
    pub replayed: usize,
    /// Applied-through after recovery
    pub applied_through: OpTime,
}

/// Bring storage and progress markers back in line with the local log.
pub fn recover(config: &ApplierConfig, parts: &Collaborators) -> ApplyResult<RecoveryReport> {
    let scope = ObservationScope::new("RECOVERY");
    let markers = parts.progress.markers()?;

    if !markers.applied_through.is_null() {
        let wall_time = parts
            .oplog
            .find(markers.applied_through.seq)
            .map(|r| r.wall_time)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let consistency = if markers.applied_through >= markers.min_valid {
            DataConsistency::Consistent
        } else {
            DataConsistency::Inconsistent
        };
        parts.member.set_last_applied_forward(
            AppliedPosition::new(markers.applied_through, wall_time),
            consistency,
        );
        parts
            .member
            .set_last_durable_forward(AppliedPosition::new(markers.applied_through, wall_time));
    }

    let mut truncated = 0;
    if let Some(point) = markers.truncate_after {
        truncated = parts.oplog.truncate_from(point).map_err(|e| {
            ApplyError::apply_failed(format!("failed to truncate local oplog at {}: {}", point, e))
        })?;
        parts.progress.set_truncate_after_point(None)?;
        let point = point.to_string();
        let count = truncated.to_string();
        log_event(Event::RecoveryTruncate, &[("from", &point), ("removed", &count)]);
    }

    let pending = parts.oplog.records_after(markers.applied_through.seq);
    let replayed = pending.len();
    if replayed > 0 {
        replay(config, parts, pending, markers.applied_through.seq)?;
    }

    let applied_through = parts.progress.markers()?.applied_through;
    let count = replayed.to_string();
    let applied = applied_through.to_string();
    scope.complete(&[("replayed", &count), ("applied_through", &applied)]);
    Ok(RecoveryReport {
        truncated,
        replayed,
        applied_through,
    })
}

fn replay(
    config: &ApplierConfig,
    parts: &Collaborators,
    records: Vec<OperationRecord>,
    after: u64,
) -> ApplyResult<()> {
    let source = MemoryLogSource::from_records(records);
    let limits = BatchLimits {
        delay: None,
        ..BatchLimits::from_config(config)
    };
    let finalizer = Arc::new(SyncFinalizer::new(Arc::clone(&parts.member)));
    let orchestrator = Orchestrator::new(config, ApplyMode::Recovering, parts.clone(), finalizer)?
        .begin_applying_after(after);

    let result = drain(&orchestrator, &source, &limits);
    orchestrator.shutdown();
    result
}

fn drain(
    orchestrator: &Orchestrator,
    source: &MemoryLogSource,
    limits: &BatchLimits,
) -> ApplyResult<()> {
    while !source.is_empty() {
        let batch = fill_batch(source, limits, &SystemClock, false);
        if batch.is_empty() {
            continue;
        }
        let ops = batch.len().to_string();
        let last = orchestrator.apply_batch(batch)?.to_string();
        log_event(Event::RecoveryReplay, &[("ops", &ops), ("last", &last)]);
    }
    Ok(())
}
