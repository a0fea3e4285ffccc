//! Node-state service
//!
//! States relevant to the apply engine:
//! - Startup: before replication starts
//! - CatchingUp: applying, local state may be inconsistent, reads refused
//! - CaughtUp: applying, local state consistent, reads served
//! - Leader: producing the log; the apply engine must not run
//!
//! Maintenance is an override flag rather than a state: while it is set
//! the node stays in CatchingUp regardless of progress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::apply::{ApplyError, ApplyResult};

/// Externally visible node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Replication not started
    Startup,
    /// Applying; not safe to serve reads
    CatchingUp,
    /// Applying; safe to serve reads
    CaughtUp,
    /// Log producer
    Leader,
}

impl NodeState {
    /// State name for logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Startup => "startup",
            NodeState::CatchingUp => "catching_up",
            NodeState::CaughtUp => "caught_up",
            NodeState::Leader => "leader",
        }
    }

    /// Whether moving from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        use NodeState::*;
        *self == next
            || matches!(
                (*self, next),
                (Startup, CatchingUp)
                    | (CatchingUp, CaughtUp)
                    | (CaughtUp, CatchingUp)
                    | (CaughtUp, Leader)
                    | (Leader, CatchingUp)
            )
    }
}

/// Node-state service as seen by the apply engine.
pub trait NodeStateService: Send + Sync {
    /// Current state.
    fn current_state(&self) -> NodeState;

    /// Whether the maintenance override is set.
    fn in_maintenance(&self) -> bool;

    /// Move to `state`.
    fn transition_to(&self, state: NodeState) -> ApplyResult<()>;

    /// The apply loop found no batch within its wait budget.
    fn signal_drain_complete(&self) {}
}

/// In-memory node-state service.
#[derive(Debug)]
pub struct MemoryNodeState {
    state: Mutex<NodeState>,
    maintenance: Mutex<bool>,
    drain_signals: AtomicU64,
}

impl MemoryNodeState {
    /// Create a service in `state`.
    pub fn new(state: NodeState) -> Self {
        Self {
            state: Mutex::new(state),
            maintenance: Mutex::new(false),
            drain_signals: AtomicU64::new(0),
        }
    }

    /// Set or clear the maintenance override.
    pub fn set_maintenance(&self, enabled: bool) {
        *self.maintenance.lock().unwrap_or_else(|e| e.into_inner()) = enabled;
    }

    /// Number of drain-complete signals received.
    pub fn drain_signals(&self) -> u64 {
        self.drain_signals.load(Ordering::SeqCst)
    }
}

impl Default for MemoryNodeState {
    fn default() -> Self {
        Self::new(NodeState::CatchingUp)
    }
}

impl NodeStateService for MemoryNodeState {
    fn current_state(&self) -> NodeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn in_maintenance(&self) -> bool {
        *self.maintenance.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition_to(&self, next: NodeState) -> ApplyResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.can_transition_to(next) {
            return Err(ApplyError::illegal_transition(format!(
                "cannot transition from {} to {}",
                state.as_str(),
                next.as_str()
            )));
        }
        *state = next;
        Ok(())
    }

    fn signal_drain_complete(&self) {
        self.drain_signals.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catching_up_can_become_caught_up() {
        let node = MemoryNodeState::default();
        node.transition_to(NodeState::CaughtUp).unwrap();
        assert_eq!(node.current_state(), NodeState::CaughtUp);
    }

    #[test]
    fn test_startup_cannot_jump_to_caught_up() {
        let node = MemoryNodeState::new(NodeState::Startup);
        let err = node.transition_to(NodeState::CaughtUp).unwrap_err();
        assert!(err.message.contains("startup"));
        assert_eq!(node.current_state(), NodeState::Startup);
    }

    #[test]
    fn test_same_state_is_idempotent() {
        let node = MemoryNodeState::new(NodeState::Leader);
        assert!(node.transition_to(NodeState::Leader).is_ok());
    }

    #[test]
    fn test_maintenance_flag() {
        let node = MemoryNodeState::default();
        assert!(!node.in_maintenance());
        node.set_maintenance(true);
        assert!(node.in_maintenance());
    }
}
