//! Node registry
//!
//! In-memory set of known peers and the screen layout around the controller.
//! The layout mapping (position -> node) is kept injective: a position is
//! held by at most one node, and the first accepted assignment wins.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::protocol::ScreenEdge;

/// Stable node identity
pub type NodeId = String;

/// Registry errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Layout conflict: {position} is already assigned to {holder}")]
    LayoutConflict {
        position: LayoutPosition,
        holder: NodeId,
    },

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Where a node's screen sits relative to the controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutPosition {
    Left,
    Right,
    Top,
    Bottom,
    #[default]
    None,
}

impl LayoutPosition {
    /// The controller edge that leads to this position
    pub fn edge(self) -> Option<ScreenEdge> {
        match self {
            LayoutPosition::Left => Some(ScreenEdge::Left),
            LayoutPosition::Right => Some(ScreenEdge::Right),
            LayoutPosition::Top => Some(ScreenEdge::Top),
            LayoutPosition::Bottom => Some(ScreenEdge::Bottom),
            LayoutPosition::None => None,
        }
    }

    pub fn from_edge(edge: ScreenEdge) -> Self {
        match edge {
            ScreenEdge::Left => LayoutPosition::Left,
            ScreenEdge::Right => LayoutPosition::Right,
            ScreenEdge::Top => LayoutPosition::Top,
            ScreenEdge::Bottom => LayoutPosition::Bottom,
        }
    }
}

impl std::fmt::Display for LayoutPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.edge() {
            Some(edge) => edge.fmt(f),
            None => f.write_str("none"),
        }
    }
}

/// Connection status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Unknown,
    Discovered,
    Linking,
    Linked,
    Lost,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Unknown => "unknown",
            NodeStatus::Discovered => "discovered",
            NodeStatus::Linking => "linking",
            NodeStatus::Linked => "linked",
            NodeStatus::Lost => "lost",
        };
        f.write_str(s)
    }
}

/// A peer as reported by discovery or configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCandidate {
    pub id: NodeId,
    pub name: String,
    pub addr: SocketAddr,
    /// Screen size when known
    pub screen: Option<(u32, u32)>,
}

/// A known peer
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub addr: SocketAddr,
    pub position: LayoutPosition,
    pub screen: Option<(u32, u32)>,
    pub status: NodeStatus,
    pub last_seen: Instant,
    /// Came from configuration rather than discovery
    pub manual: bool,
}

impl Node {
    pub fn is_linked(&self) -> bool {
        self.status == NodeStatus::Linked
    }
}

/// What a sweep changed
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub lost: Vec<NodeId>,
    pub forgotten: Vec<NodeId>,
}

/// Registry of known nodes
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<NodeId, Node>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a discovered node. Refreshes address, name and last-seen for a
    /// known node and keeps its layout position. Returns true if the node
    /// was new.
    pub fn upsert(&mut self, candidate: NodeCandidate, now: Instant) -> bool {
        match self.nodes.get_mut(&candidate.id) {
            Some(node) => {
                if node.addr != candidate.addr {
                    tracing::info!(
                        node = %node.id,
                        old = %node.addr,
                        new = %candidate.addr,
                        "node address changed"
                    );
                }
                node.addr = candidate.addr;
                node.name = candidate.name;
                if candidate.screen.is_some() {
                    node.screen = candidate.screen;
                }
                node.last_seen = now;
                if matches!(node.status, NodeStatus::Unknown | NodeStatus::Lost) {
                    node.status = NodeStatus::Discovered;
                }
                false
            }
            None => {
                tracing::info!(node = %candidate.id, addr = %candidate.addr, "node discovered");
                self.nodes.insert(
                    candidate.id.clone(),
                    Node {
                        id: candidate.id,
                        name: candidate.name,
                        addr: candidate.addr,
                        position: LayoutPosition::None,
                        screen: candidate.screen,
                        status: NodeStatus::Discovered,
                        last_seen: now,
                        manual: false,
                    },
                );
                true
            }
        }
    }

    /// Add a node from configuration with its layout position
    pub fn add_manual(
        &mut self,
        candidate: NodeCandidate,
        position: LayoutPosition,
        now: Instant,
    ) -> RegistryResult<()> {
        self.check_position(&candidate.id, position)?;
        let id = candidate.id.clone();
        let is_new = self.upsert(candidate, now);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.manual = true;
            node.position = position;
            // Configured but not yet heard from
            if is_new {
                node.status = NodeStatus::Unknown;
            }
        }
        Ok(())
    }

    /// Place a node in the layout. Rejects a position already held by
    /// another node; `None` always succeeds.
    pub fn assign_layout(&mut self, id: &str, position: LayoutPosition) -> RegistryResult<()> {
        if !self.nodes.contains_key(id) {
            return Err(RegistryError::UnknownNode(id.to_string()));
        }
        self.check_position(id, position)?;
        if let Some(node) = self.nodes.get_mut(id) {
            node.position = position;
            tracing::info!(node = %id, %position, "layout assigned");
        }
        Ok(())
    }

    fn check_position(&self, id: &str, position: LayoutPosition) -> RegistryResult<()> {
        if position == LayoutPosition::None {
            return Ok(());
        }
        match self
            .nodes
            .values()
            .find(|n| n.position == position && n.id != id)
        {
            Some(holder) => Err(RegistryError::LayoutConflict {
                position,
                holder: holder.id.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node placed beyond a controller edge
    pub fn node_at(&self, edge: ScreenEdge) -> Option<&Node> {
        let position = LayoutPosition::from_edge(edge);
        self.nodes.values().find(|n| n.position == position)
    }

    /// Snapshot of the layout
    pub fn layout(&self) -> HashMap<ScreenEdge, NodeId> {
        self.nodes
            .values()
            .filter_map(|n| n.position.edge().map(|edge| (edge, n.id.clone())))
            .collect()
    }

    pub fn set_status(&mut self, id: &str, status: NodeStatus) -> RegistryResult<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownNode(id.to_string()))?;
        if node.status != status {
            tracing::debug!(node = %id, from = %node.status, to = %status, "node status");
            node.status = status;
        }
        Ok(())
    }

    pub fn mark_lost(&mut self, id: &str) -> RegistryResult<()> {
        self.set_status(id, NodeStatus::Lost)
    }

    /// Refresh last-seen on link traffic
    pub fn touch(&mut self, id: &str, now: Instant) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.last_seen = now;
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Node> {
        self.nodes.remove(id)
    }

    /// Mark nodes without a link and silent for `lost_after` as lost, and
    /// drop discovered (non-manual) nodes silent for `forget_after`.
    pub fn sweep(&mut self, now: Instant, lost_after: Duration, forget_after: Duration) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for node in self.nodes.values_mut() {
            if matches!(node.status, NodeStatus::Linked | NodeStatus::Linking) {
                continue;
            }
            let silent = now.saturating_duration_since(node.last_seen);
            if silent >= forget_after && !node.manual {
                outcome.forgotten.push(node.id.clone());
            } else if silent >= lost_after && node.status == NodeStatus::Discovered {
                node.status = NodeStatus::Lost;
                outcome.lost.push(node.id.clone());
            }
        }

        for id in &outcome.forgotten {
            self.nodes.remove(id);
            tracing::info!(node = %id, "node forgotten after prolonged silence");
        }
        for id in &outcome.lost {
            tracing::info!(node = %id, "node silent, marked lost");
        }

        outcome
    }
}
