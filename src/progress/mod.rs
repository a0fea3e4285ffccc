//! Replication progress
//!
//! - `ProgressStore`: crash-durable markers (applied-through, min-valid,
//!   truncate-after point)
//! - `MemberProgress`: this member's in-memory applied and durable positions

mod errors;
mod member;
mod store;

pub use errors::{ProgressError, ProgressResult};
pub use member::{AppliedPosition, DataConsistency, MemberProgress};
pub use store::{FileProgressStore, MemoryProgressStore, ProgressMarkers, ProgressStore};
