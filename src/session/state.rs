//! Session ownership states

use std::fmt;
use std::time::Instant;

use crate::registry::NodeId;

/// Who input is applied to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    Local,
    Node(NodeId),
}

impl Owner {
    pub fn is_local(&self) -> bool {
        matches!(self, Owner::Local)
    }

    pub fn node(&self) -> Option<&str> {
        match self {
            Owner::Local => None,
            Owner::Node(id) => Some(id),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Local => f.write_str("local"),
            Owner::Node(id) => write!(f, "node:{}", id),
        }
    }
}

/// Session state on the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Not started, or shut down
    Idle,
    Owned(Owner),
    /// Handoff in flight. `entry` is where the cursor lands on `to` when it
    /// is a node.
    Transferring {
        from: Owner,
        to: Owner,
        transfer_id: u32,
        started: Instant,
        entry: Option<(i32, i32)>,
    },
    /// The owning node's link dropped; recovery to local is immediate
    Degraded { node: NodeId },
}

impl SessionState {
    /// Current owner. Total over all states: anything without a settled
    /// node owner is owned locally, and a handoff is still owned by the side
    /// it started from.
    pub fn owner(&self) -> Owner {
        match self {
            SessionState::Idle | SessionState::Degraded { .. } => Owner::Local,
            SessionState::Owned(owner) => owner.clone(),
            SessionState::Transferring { from, .. } => from.clone(),
        }
    }

    pub fn is_transferring(&self) -> bool {
        matches!(self, SessionState::Transferring { .. })
    }

    /// The remote node involved in this state, if any
    pub fn involved_node(&self) -> Option<&str> {
        match self {
            SessionState::Idle => None,
            SessionState::Owned(owner) => owner.node(),
            SessionState::Transferring { from, to, .. } => from.node().or_else(|| to.node()),
            SessionState::Degraded { node } => Some(node),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Owned(owner) => write!(f, "owner={}", owner),
            SessionState::Transferring { from, to, transfer_id, .. } => {
                write!(f, "transferring({} -> {}, #{})", from, to, transfer_id)
            }
            SessionState::Degraded { node } => write!(f, "degraded(node:{})", node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_is_total() {
        let b = Owner::Node("b".to_string());
        assert_eq!(SessionState::Idle.owner(), Owner::Local);
        assert_eq!(SessionState::Owned(b.clone()).owner(), b);
        assert_eq!(
            SessionState::Degraded { node: "b".to_string() }.owner(),
            Owner::Local
        );
        let returning = SessionState::Transferring {
            from: b.clone(),
            to: Owner::Local,
            transfer_id: 3,
            started: Instant::now(),
            entry: None,
        };
        assert_eq!(returning.owner(), b);
        assert_eq!(returning.involved_node(), Some("b"));
        assert_eq!(returning.to_string(), "transferring(node:b -> local, #3)");
    }
}
