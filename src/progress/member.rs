//! In-memory view of this member's applied and durable positions
//!
//! The orchestrator (through the finalizer) advances the applied position,
//! the finalizer advances the durable position. Both only move forward.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::oplog::OpTime;

/// A log position with the wall time of its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedPosition {
    /// Log position
    pub op_time: OpTime,
    /// Wall time of the record at that position
    pub wall_time: DateTime<Utc>,
}

impl AppliedPosition {
    /// Create a new position.
    pub fn new(op_time: OpTime, wall_time: DateTime<Utc>) -> Self {
        Self { op_time, wall_time }
    }

    /// The null position.
    pub fn null() -> Self {
        Self {
            op_time: OpTime::null(),
            wall_time: DateTime::<Utc>::MIN_UTC,
        }
    }
}

/// Whether local data is consistent at the recorded applied position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataConsistency {
    /// Applied position is at or past min-valid
    Consistent,
    /// Applied position is below min-valid
    Inconsistent,
}

#[derive(Debug)]
struct Positions {
    applied: AppliedPosition,
    durable: AppliedPosition,
    consistency: DataConsistency,
}

/// Applied and durable positions of this member.
#[derive(Debug)]
pub struct MemberProgress {
    positions: Mutex<Positions>,
}

impl Default for MemberProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl MemberProgress {
    /// Create a tracker at the null position.
    pub fn new() -> Self {
        Self::starting_at(AppliedPosition::null())
    }

    /// Create a tracker whose applied and durable positions start at `at`.
    pub fn starting_at(at: AppliedPosition) -> Self {
        Self {
            positions: Mutex::new(Positions {
                applied: at,
                durable: at,
                consistency: DataConsistency::Inconsistent,
            }),
        }
    }

    /// Advance the applied position. Returns whether it moved.
    pub fn set_last_applied_forward(
        &self,
        at: AppliedPosition,
        consistency: DataConsistency,
    ) -> bool {
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        if at.op_time > positions.applied.op_time {
            positions.applied = at;
            positions.consistency = consistency;
            true
        } else {
            false
        }
    }

    /// Advance the durable position. Returns whether it moved.
    pub fn set_last_durable_forward(&self, at: AppliedPosition) -> bool {
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        if at.op_time > positions.durable.op_time {
            positions.durable = at;
            true
        } else {
            false
        }
    }

    /// Last applied position.
    pub fn last_applied(&self) -> AppliedPosition {
        self.positions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .applied
    }

    /// Last durable position.
    pub fn last_durable(&self) -> AppliedPosition {
        self.positions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .durable
    }

    /// Consistency recorded with the last applied position.
    pub fn consistency(&self) -> DataConsistency {
        self.positions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consistency
    }
}
