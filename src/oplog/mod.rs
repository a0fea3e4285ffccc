//! Operation log types
//!
//! - `OperationRecord`: a single replicated mutation or command
//! - `Batch`: an ordered run of records handed to the orchestrator
//! - `LogSource`: the leader-fed FIFO the batcher drains
//! - `LocalOplog`: the follower's own log, used for chain walks and recovery

mod batch;
mod local;
mod record;
mod source;

pub use batch::Batch;
pub use local::{LocalOplog, MemoryOplog};
pub use record::{
    is_server_configuration, is_view_catalog, CommandKind, OpKind, OpTime, OperationRecord,
    SessionInfo, SERVER_CONFIGURATION_NAMESPACE, SESSION_TABLE_NAMESPACE,
};
pub use source::{LogSource, MemoryLogSource};
