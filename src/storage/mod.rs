//! Storage apply surface
//!
//! The apply engine treats storage as an external collaborator:
//! - `StorageEngine`: apply one record under an `ApplyMode`
//! - `MemoryStorage`: in-memory engine used by the CLI and tests
//!
//! Per-record atomicity is the engine's responsibility; the apply engine
//! relies on it when a batch aborts midway.

mod engine;
mod errors;
mod memory;

pub use engine::{ApplyMode, MultikeyPathInfo, SideEffects, StorageEngine};
pub use errors::{StorageError, StorageResult};
pub use memory::{set_fields, AppliedEntry, MemoryStorage};
