//! repl-applier - Replicated-log apply engine for database followers
//!
//! Turns an ordered stream of committed operation records into local
//! storage state: batches them, expands containers and transactions,
//! partitions the result into parallel writer lanes, applies lanes with
//! idempotency rules, and advances crash-durable progress markers so a
//! restart resumes at a consistent point.

pub mod apply;
pub mod cli;
pub mod crash_point;
pub mod node;
pub mod observability;
pub mod oplog;
pub mod progress;
pub mod storage;
