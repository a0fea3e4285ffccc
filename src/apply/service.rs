//! Apply service lifecycle
//!
//! Start order: validate config, leave startup, recover, pick the
//! finalizer, start the batcher, spawn the orchestrator thread.
//! Stop order is the reverse: ask the batcher for a shutdown marker, join
//! the orchestrator (it drains in-flight lanes), join the batcher, then
//! let the finalizer finish pending durability waits. The first failure
//! of the apply loop or the finalizer is the service's outcome.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::batcher::{BatchLimits, BatchQueue, Batcher, Clock, SystemClock};
use super::config::ApplierConfig;
use super::errors::{ApplyError, ApplyResult};
use super::finalizer::{finalizer_for, Finalizer};
use super::orchestrator::{Collaborators, Orchestrator};
use super::recovery::{recover, RecoveryReport};
use crate::node::{NodeState, NodeStateService};
use crate::observability::{log_event, Event};
use crate::oplog::{LogSource, OpTime};
use crate::storage::ApplyMode;

/// Entry point for running the apply engine.
pub struct ApplierService;

impl ApplierService {
    /// Recover, then start applying records from `source` in the background.
    pub fn start(
        config: ApplierConfig,
        mode: ApplyMode,
        source: Arc<dyn LogSource>,
        parts: Collaborators,
    ) -> ApplyResult<ServiceHandle> {
        Self::start_with_clock(config, mode, source, parts, Arc::new(SystemClock))
    }

    /// As `start`, with an explicit clock for the replication-delay cutoff.
    pub fn start_with_clock(
        config: ApplierConfig,
        mode: ApplyMode,
        source: Arc<dyn LogSource>,
        parts: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> ApplyResult<ServiceHandle> {
        config.validate()?;
        if mode == ApplyMode::Recovering {
            return Err(ApplyError::configuration(
                "recovering mode is reserved for startup replay",
            ));
        }

        if parts.node.current_state() == NodeState::Startup {
            parts.node.transition_to(NodeState::CatchingUp)?;
        }

        let recovery = recover(&config, &parts)?;

        let finalizer = finalizer_for(Arc::clone(&parts.storage), Arc::clone(&parts.member))
            .map_err(|e| {
                ApplyError::apply_failed(format!("failed to start finalizer thread: {}", e))
            })?;
        let orchestrator = Orchestrator::new(&config, mode, parts.clone(), Arc::clone(&finalizer))?;

        let batcher = Batcher::start(source, BatchLimits::from_config(&config), clock)
            .map_err(|e| {
                ApplyError::apply_failed(format!("failed to start batcher thread: {}", e))
            })?;
        let queue = batcher.queue();

        let threads = config.writer_threads.to_string();
        log_event(
            Event::ApplierStart,
            &[("mode", mode.as_str()), ("writer_threads", &threads)],
        );

        let thread_queue = queue.clone();
        let handle = thread::Builder::new()
            .name("repl-apply".to_string())
            .spawn(move || {
                let result = orchestrator.run(&thread_queue);
                // A failed run must not leave the batcher blocked on handoff
                thread_queue.close();
                orchestrator.shutdown();
                result
            })
            .map_err(|e| {
                ApplyError::apply_failed(format!("failed to start apply thread: {}", e))
            })?;

        Ok(ServiceHandle {
            parts,
            queue,
            batcher,
            finalizer,
            orchestrator: Some(handle),
            recovery,
        })
    }
}

/// Running apply service.
pub struct ServiceHandle {
    parts: Collaborators,
    queue: BatchQueue,
    batcher: Batcher,
    finalizer: Arc<dyn Finalizer>,
    orchestrator: Option<JoinHandle<ApplyResult<()>>>,
    recovery: RecoveryReport,
}

impl ServiceHandle {
    /// What startup recovery did.
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    /// Collaborators the service runs against.
    pub fn parts(&self) -> &Collaborators {
        &self.parts
    }

    /// Whether the orchestrator thread has exited.
    pub fn is_finished(&self) -> bool {
        self.orchestrator
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }

    /// Block until this member has applied through `target`.
    ///
    /// Returns false on timeout or if the apply thread exits first.
    pub fn wait_for_applied(&self, target: OpTime, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.parts.member.last_applied().op_time >= target {
                return true;
            }
            if self.is_finished() || Instant::now() >= deadline {
                return self.parts.member.last_applied().op_time >= target;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Stop all threads and return the apply loop's outcome.
    pub fn shutdown(mut self) -> ApplyResult<()> {
        self.queue.request_stop();
        let result = match self.orchestrator.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(ApplyError::apply_failed("apply thread panicked"))
            }),
            None => Ok(()),
        };
        self.batcher.stop();
        let durability = self.finalizer.shutdown();
        let result = result.and(durability);

        let applied = self.parts.member.last_applied().op_time.to_string();
        let outcome = match &result {
            Ok(()) => "clean".to_string(),
            Err(err) => err.to_string(),
        };
        log_event(
            Event::ApplierStop,
            &[("applied", &applied), ("outcome", &outcome)],
        );
        result
    }
}
