//! Replicated log apply engine
//!
//! Records flow through:
//! - `batcher`: groups log source records into bounded batches
//! - `partition`: expands containers and transactions, synthesizes
//!   session-table writes, assigns records to writer lanes
//! - `worker`: applies lanes in parallel with idempotency rules
//! - `orchestrator`: per-batch ordering of local log write, progress
//!   markers, lanes and finalization
//! - `finalizer`: advances applied and durable progress
//!
//! `recovery` replays the local log after a crash; `service` wires the
//! threads together.

mod batcher;
mod config;
mod decompose;
mod errors;
mod fetch;
mod finalizer;
mod lock;
mod orchestrator;
mod partition;
mod recovery;
mod service;
mod session;
mod worker;

pub use batcher::{fill_batch, BatchLimits, BatchQueue, Batcher, BatcherState, Clock, SystemClock};
pub use config::ApplierConfig;
pub use decompose::{parse_apply_ops, Decomposer};
pub use errors::{ApplyError, ApplyErrorKind, ApplyResult};
pub use fetch::{fetch_with_retry, FetchError, FetchPolicy, MissingDocumentSource};
pub use finalizer::{finalizer_for, AsyncFinalizer, Finalizer, SyncFinalizer};
pub use lock::{BatchApplicationLock, BatchGuard, ReadGuard};
pub use orchestrator::{Collaborators, Orchestrator};
pub use partition::{Partitioner, WriterLane};
pub use recovery::{recover, RecoveryReport};
pub use service::{ApplierService, ServiceHandle};
pub use session::SessionTracker;
pub use worker::{apply_lane, LaneContext, WorkerPool};
