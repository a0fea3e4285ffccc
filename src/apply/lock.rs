//! Batch-application exclusivity token
//!
//! The orchestrator holds the write side for the whole of a batch, from
//! the truncate point to the finalizer hand-off. External readers take the
//! read side and so never observe a batch with only some lanes applied.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Process-wide batch-application lock.
#[derive(Debug, Default)]
pub struct BatchApplicationLock {
    inner: RwLock<()>,
}

/// Held by the orchestrator while a batch is being applied.
pub struct BatchGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

/// Held by a reader of storage.
pub struct ReadGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

impl BatchApplicationLock {
    /// Create an unlocked token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block readers until the guard drops.
    pub fn begin_batch(&self) -> BatchGuard<'_> {
        BatchGuard {
            _guard: self.inner.write().unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Wait for any in-flight batch, then hold off the next one.
    pub fn read(&self) -> ReadGuard<'_> {
        ReadGuard {
            _guard: self.inner.read().unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Non-blocking read attempt; `None` while a batch is in flight.
    pub fn try_read(&self) -> Option<ReadGuard<'_>> {
        self.inner.try_read().ok().map(|guard| ReadGuard { _guard: guard })
    }
}
