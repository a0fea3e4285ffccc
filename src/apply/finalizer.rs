//! Progress finalization
//!
//! After a batch is applied the orchestrator hands its last position to a
//! finalizer:
//! - `SyncFinalizer`: storage writes are durable on return, so applied and
//!   durable progress advance together
//! - `AsyncFinalizer`: applied progress advances immediately; a background
//!   thread waits for storage durability and only then advances durable
//!   progress. A failed durability wait stops the thread and is reported
//!   by the next `record` and by `shutdown`

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use super::errors::{ApplyError, ApplyResult};
use crate::observability::{Event, Logger};
use crate::progress::{AppliedPosition, DataConsistency, MemberProgress};
use crate::storage::StorageEngine;

/// Records progress of applied batches.
pub trait Finalizer: Send + Sync {
    /// Record that everything up to `at` is applied.
    fn record(&self, at: AppliedPosition, consistency: DataConsistency) -> ApplyResult<()>;

    /// Finish outstanding work and stop background threads.
    fn shutdown(&self) -> ApplyResult<()> {
        Ok(())
    }
}

/// Pick the finalizer matching the storage engine's durability model.
pub fn finalizer_for(
    storage: Arc<dyn StorageEngine>,
    progress: Arc<MemberProgress>,
) -> std::io::Result<Arc<dyn Finalizer>> {
    if storage.supports_async_durability() {
        Ok(Arc::new(AsyncFinalizer::start(storage, progress)?))
    } else {
        Ok(Arc::new(SyncFinalizer::new(progress)))
    }
}

/// Finalizer for synchronously durable storage.
pub struct SyncFinalizer {
    progress: Arc<MemberProgress>,
}

impl SyncFinalizer {
    /// Create a finalizer advancing `progress`.
    pub fn new(progress: Arc<MemberProgress>) -> Self {
        Self { progress }
    }
}

impl Finalizer for SyncFinalizer {
    fn record(&self, at: AppliedPosition, consistency: DataConsistency) -> ApplyResult<()> {
        self.progress.set_last_applied_forward(at, consistency);
        self.progress.set_last_durable_forward(at);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Pending {
    latest: Option<AppliedPosition>,
    stopping: bool,
    failure: Option<String>,
}

impl Pending {
    fn check(&self) -> ApplyResult<()> {
        match &self.failure {
            Some(reason) => Err(ApplyError::apply_failed(format!(
                "durability wait failed: {}",
                reason
            ))),
            None => Ok(()),
        }
    }
}

struct Shared {
    pending: Mutex<Pending>,
    wake: Condvar,
}

/// Finalizer for storage that confirms durability asynchronously.
pub struct AsyncFinalizer {
    progress: Arc<MemberProgress>,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncFinalizer {
    /// Spawn the durability thread.
    pub fn start(
        storage: Arc<dyn StorageEngine>,
        progress: Arc<MemberProgress>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            wake: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let thread_progress = Arc::clone(&progress);
        let handle = thread::Builder::new()
            .name("repl-finalizer".to_string())
            .spawn(move || durability_loop(&thread_shared, storage.as_ref(), &thread_progress))?;
        Ok(Self {
            progress,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }
}

impl Finalizer for AsyncFinalizer {
    fn record(&self, at: AppliedPosition, consistency: DataConsistency) -> ApplyResult<()> {
        let mut pending = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        pending.check()?;
        self.progress.set_last_applied_forward(at, consistency);
        pending.latest = Some(at);
        self.shared.wake.notify_one();
        Ok(())
    }

    fn shutdown(&self) -> ApplyResult<()> {
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.stopping = true;
            self.shared.wake.notify_one();
        }
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                return Err(ApplyError::apply_failed("finalizer thread panicked"));
            }
        }
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .check()
    }
}

fn durability_loop(shared: &Shared, storage: &dyn StorageEngine, progress: &MemberProgress) {
    loop {
        let (next, stopping) = {
            let pending = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
            let mut pending = shared
                .wake
                .wait_while(pending, |p| p.latest.is_none() && !p.stopping)
                .unwrap_or_else(|e| e.into_inner());
            (pending.latest.take(), pending.stopping)
        };

        if let Some(at) = next {
            match storage.wait_until_durable() {
                Ok(()) => {
                    progress.set_last_durable_forward(at);
                }
                Err(err) => {
                    let reason = err.to_string();
                    Logger::error(Event::FinalizerStop.as_str(), &[("reason", &reason)]);
                    shared
                        .pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .failure = Some(reason);
                    return;
                }
            }
        }
        if stopping {
            break;
        }
    }
    Logger::info(Event::FinalizerStop.as_str(), &[]);
}
