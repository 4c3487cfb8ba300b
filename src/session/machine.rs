//! Session state machine
//!
//! Decides who owns input. It never performs I/O: every operation returns
//! the actions the caller must carry out (messages to send, cursor warps,
//! local suppression), so the service loop can apply them after the
//! decision is made.

use std::time::{Duration, Instant};

use super::state::{Owner, SessionState};
use crate::input::InputEvent;
use crate::protocol::{ControlMessage, Message, ScreenEdge};
use crate::registry::{NodeId, NodeRegistry};
use crate::screen::{entry_point, return_point, EdgeDetectResult, EdgeDetector, EdgeDetectorConfig, ScreenRect};

/// Something the caller must do after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Queue a message on a node's link
    Send(NodeId, Message),
    /// Keep the local cursor at this point (crossing refused)
    Clamp((i32, i32)),
    /// Hide local input from the local machine (true) or give it back
    SuppressLocal(bool),
    /// Move the local cursor
    Warp((i32, i32)),
}

/// Controller-side session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub screen: ScreenRect,
    pub transfer_timeout: Duration,
    /// How far inside the controller screen a returning cursor lands
    pub return_inset: i32,
    pub edges: EdgeDetectorConfig,
}

impl SessionConfig {
    pub fn new(screen: ScreenRect) -> Self {
        Self {
            screen,
            transfer_timeout: Duration::from_millis(1000),
            return_inset: 1,
            edges: EdgeDetectorConfig::default(),
        }
    }
}

/// A cursor sample from the controller's own screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorSample {
    pub x: i32,
    pub y: i32,
    pub dx: i32,
    pub dy: i32,
}

/// Single owner of the session state
pub struct SessionMachine {
    state: SessionState,
    screen: ScreenRect,
    transfer_timeout: Duration,
    return_inset: i32,
    detector: EdgeDetector,
    next_transfer_id: u32,
}

impl SessionMachine {
    pub fn new(config: SessionConfig) -> Self {
        let detector = EdgeDetector::new(config.edges, config.screen.width, config.screen.height);
        Self {
            state: SessionState::Idle,
            screen: config.screen,
            transfer_timeout: config.transfer_timeout,
            return_inset: config.return_inset,
            detector,
            next_transfer_id: 1,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn owner(&self) -> Owner {
        self.state.owner()
    }

    pub fn screen(&self) -> ScreenRect {
        self.screen
    }

    fn transition(&mut self, next: SessionState) {
        tracing::info!(from = %self.state, to = %next, "session transition");
        self.state = next;
    }

    fn allocate_transfer_id(&mut self) -> u32 {
        let id = self.next_transfer_id;
        self.next_transfer_id = self.next_transfer_id.wrapping_add(1).max(1);
        id
    }

    fn node_rect(&self, registry: &NodeRegistry, id: &str) -> ScreenRect {
        registry
            .get(id)
            .and_then(|node| node.screen)
            .map(|(w, h)| ScreenRect::new(w, h))
            .unwrap_or(self.screen)
    }

    /// Idle -> Owner(Local)
    pub fn start(&mut self) -> Vec<Action> {
        if self.state == SessionState::Idle {
            self.transition(SessionState::Owned(Owner::Local));
        }
        Vec::new()
    }

    /// Local cursor moved. Only acts while the controller owns input.
    pub fn on_cursor(&mut self, sample: CursorSample, registry: &NodeRegistry, now: Instant) -> Vec<Action> {
        if self.state != SessionState::Owned(Owner::Local) {
            return Vec::new();
        }

        match self.detector.check(sample.x, sample.y, sample.dx, sample.dy) {
            EdgeDetectResult::NotAtEdge | EdgeDetectResult::Resting { .. } => Vec::new(),
            EdgeDetectResult::Dwelling { edge, .. } => {
                if registry.node_at(edge).is_some() {
                    vec![Action::Clamp(self.screen.clamp(sample.x, sample.y))]
                } else {
                    Vec::new()
                }
            }
            EdgeDetectResult::Transition { edge, along } => self.cross(edge, along, registry, now),
        }
    }

    fn cross(&mut self, edge: ScreenEdge, along: i32, registry: &NodeRegistry, now: Instant) -> Vec<Action> {
        let Some(node) = registry.node_at(edge) else {
            return Vec::new();
        };
        let clamp = self.screen.point_on_edge(edge, along, 0);
        if !node.is_linked() {
            tracing::debug!(node = %node.id, status = %node.status, %edge, "crossing ignored, node not linked");
            return vec![Action::Clamp(clamp)];
        }

        let target = self.node_rect(registry, &node.id);
        let (entry_edge, (x, y)) = entry_point(edge, along, self.screen, target);
        let transfer_id = self.allocate_transfer_id();
        let id = node.id.clone();

        self.transition(SessionState::Transferring {
            from: Owner::Local,
            to: Owner::Node(id.clone()),
            transfer_id,
            started: now,
            entry: Some((x, y)),
        });
        vec![Action::Send(
            id,
            Message::Control(ControlMessage::TransferRequest {
                transfer_id,
                edge: entry_edge,
                x,
                y,
            }),
        )]
    }

    /// A control message arrived on `node`'s link
    pub fn on_control(
        &mut self,
        node: &str,
        message: &ControlMessage,
        registry: &NodeRegistry,
        now: Instant,
    ) -> Vec<Action> {
        match message {
            ControlMessage::TransferAck { transfer_id } => self.on_transfer_ack(node, *transfer_id, registry),
            ControlMessage::TransferReject { transfer_id, reason } => {
                if !self.is_pending_transfer_to(node, *transfer_id) {
                    return Vec::new();
                }
                tracing::warn!(%node, %reason, "transfer rejected");
                self.transition(SessionState::Owned(Owner::Local));
                if let Some(edge) = self.detector.current_edge() {
                    self.detector.settle_at(edge);
                }
                Vec::new()
            }
            ControlMessage::ReturnRequest { edge, along } => {
                if self.state != SessionState::Owned(Owner::Node(node.to_string())) {
                    tracing::debug!(%node, state = %self.state, "ignoring return request");
                    return Vec::new();
                }
                let from = self.node_rect(registry, node);
                let point = return_point(*edge, *along, from, self.screen, self.return_inset);
                let transfer_id = self.allocate_transfer_id();

                self.detector.reset();
                self.transition(SessionState::Transferring {
                    from: Owner::Node(node.to_string()),
                    to: Owner::Local,
                    transfer_id,
                    started: now,
                    entry: Some(point),
                });
                vec![
                    Action::Send(node.to_string(), Message::Control(ControlMessage::ReturnAck)),
                    Action::SuppressLocal(false),
                    Action::Warp(point),
                ]
            }
            other => {
                tracing::debug!(%node, message = ?other, "unexpected control message on controller");
                Vec::new()
            }
        }
    }

    fn is_pending_transfer_to(&self, node: &str, id: u32) -> bool {
        matches!(
            &self.state,
            SessionState::Transferring { from: Owner::Local, to: Owner::Node(to), transfer_id, .. }
                if to == node && *transfer_id == id
        )
    }

    fn on_transfer_ack(&mut self, node: &str, id: u32, registry: &NodeRegistry) -> Vec<Action> {
        if !self.is_pending_transfer_to(node, id) {
            tracing::debug!(%node, transfer_id = id, state = %self.state, "ignoring stale transfer ack");
            return Vec::new();
        }
        let entry = match &self.state {
            SessionState::Transferring { entry, .. } => *entry,
            _ => None,
        };

        if !registry.get(node).map(|n| n.is_linked()).unwrap_or(false) {
            tracing::warn!(%node, "transfer ack from a node that is no longer linked");
            self.transition(SessionState::Owned(Owner::Local));
            return Vec::new();
        }

        self.transition(SessionState::Owned(Owner::Node(node.to_string())));
        let mut actions = vec![Action::SuppressLocal(true)];
        if let Some((x, y)) = entry {
            actions.push(Action::Send(node.to_string(), Message::Input(InputEvent::mouse_to(x, y))));
        }
        actions
    }

    /// The return handoff has been handed to the link (or the link failed)
    pub fn complete_return(&mut self) -> Vec<Action> {
        if let SessionState::Transferring { to: Owner::Local, .. } = self.state {
            self.transition(SessionState::Owned(Owner::Local));
        }
        Vec::new()
    }

    /// `node`'s link closed for any reason
    pub fn on_link_lost(&mut self, node: &str) -> Vec<Action> {
        match &self.state {
            SessionState::Owned(Owner::Node(owner)) if owner == node => {
                tracing::warn!(%node, "owning node lost, reclaiming local input");
                self.transition(SessionState::Degraded { node: node.to_string() });
                self.transition(SessionState::Owned(Owner::Local));
                self.detector.reset();
                vec![Action::SuppressLocal(false), Action::Warp(self.screen.centre())]
            }
            SessionState::Transferring { from, to, .. }
                if from.node() == Some(node) || to.node() == Some(node) =>
            {
                tracing::warn!(%node, "link lost during handoff");
                self.transition(SessionState::Owned(Owner::Local));
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Abandon a handoff that has not completed within the transfer timeout
    pub fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        let SessionState::Transferring { from, to, started, .. } = &self.state else {
            return Vec::new();
        };
        if now.saturating_duration_since(*started) < self.transfer_timeout {
            return Vec::new();
        }

        tracing::warn!(state = %self.state, "handoff timed out");
        let actions = match (from, to) {
            // The node may still act on the request; tell it to stand down
            (Owner::Local, Owner::Node(node)) => {
                vec![Action::Send(node.clone(), Message::Control(ControlMessage::Revoke))]
            }
            _ => Vec::new(),
        };
        self.transition(SessionState::Owned(Owner::Local));
        actions
    }

    /// Take input back from the owning node (release hotkey)
    pub fn reclaim(&mut self) -> Vec<Action> {
        match self.state.clone() {
            SessionState::Owned(Owner::Node(node)) => {
                tracing::info!(%node, "reclaiming input");
                self.transition(SessionState::Owned(Owner::Local));
                self.detector.reset();
                vec![
                    Action::Send(node, Message::Control(ControlMessage::Revoke)),
                    Action::SuppressLocal(false),
                    Action::Warp(self.screen.centre()),
                ]
            }
            SessionState::Transferring { from: Owner::Local, to: Owner::Node(node), .. } => {
                self.transition(SessionState::Owned(Owner::Local));
                vec![Action::Send(node, Message::Control(ControlMessage::Revoke))]
            }
            _ => Vec::new(),
        }
    }

    /// Return to local ownership and stop
    pub fn shutdown(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(node) = self.state.involved_node() {
            if !matches!(self.state, SessionState::Degraded { .. }) {
                actions.push(Action::Send(
                    node.to_string(),
                    Message::Control(ControlMessage::Revoke),
                ));
            }
        }
        actions.push(Action::SuppressLocal(false));
        if self.state != SessionState::Idle {
            self.transition(SessionState::Owned(Owner::Local));
            self.transition(SessionState::Idle);
        }
        self.detector.reset();
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{LayoutPosition, NodeCandidate, NodeStatus};
    use std::net::SocketAddr;

    const SCREEN: ScreenRect = ScreenRect {
        width: 1920,
        height: 1080,
    };

    fn registry_with(id: &str, position: LayoutPosition, status: NodeStatus) -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        let addr: SocketAddr = "10.0.0.2:24800".parse().unwrap();
        registry
            .add_manual(
                NodeCandidate {
                    id: id.to_string(),
                    name: id.to_string(),
                    addr,
                    screen: Some((1920, 1080)),
                },
                position,
                Instant::now(),
            )
            .unwrap();
        registry.set_status(id, status).unwrap();
        registry
    }

    fn started() -> SessionMachine {
        let mut machine = SessionMachine::new(SessionConfig::new(SCREEN));
        machine.start();
        machine
    }

    fn push_right(machine: &mut SessionMachine, registry: &NodeRegistry, y: i32) -> Vec<Action> {
        let now = Instant::now();
        machine.on_cursor(CursorSample { x: 1917, y, dx: 1, dy: 0 }, registry, now);
        machine.on_cursor(CursorSample { x: 1918, y, dx: 1, dy: 0 }, registry, now);
        machine.on_cursor(CursorSample { x: 1919, y, dx: 1, dy: 0 }, registry, now)
    }

    fn transfer_id_of(actions: &[Action]) -> u32 {
        actions
            .iter()
            .find_map(|a| match a {
                Action::Send(_, Message::Control(ControlMessage::TransferRequest { transfer_id, .. })) => {
                    Some(*transfer_id)
                }
                _ => None,
            })
            .expect("transfer request")
    }

    /// Drive the machine to Owner(b) with b on the right
    fn owned_by_b() -> (SessionMachine, NodeRegistry) {
        let registry = registry_with("b", LayoutPosition::Right, NodeStatus::Linked);
        let mut machine = started();
        let actions = push_right(&mut machine, &registry, 540);
        let id = transfer_id_of(&actions);
        machine.on_control("b", &ControlMessage::TransferAck { transfer_id: id }, &registry, Instant::now());
        assert_eq!(machine.owner(), Owner::Node("b".to_string()));
        (machine, registry)
    }

    #[test]
    fn test_start_from_idle() {
        let mut machine = SessionMachine::new(SessionConfig::new(SCREEN));
        assert_eq!(machine.state(), &SessionState::Idle);
        assert_eq!(machine.owner(), Owner::Local);
        machine.start();
        assert_eq!(machine.state(), &SessionState::Owned(Owner::Local));
    }

    #[test]
    fn test_crossing_to_linked_node_on_the_right() {
        let registry = registry_with("b", LayoutPosition::Right, NodeStatus::Linked);
        let mut machine = started();

        let actions = push_right(&mut machine, &registry, 540);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Send(node, Message::Control(ControlMessage::TransferRequest { edge, x, y, .. })) => {
                assert_eq!(node, "b");
                assert_eq!(*edge, ScreenEdge::Left);
                assert_eq!((*x, *y), (0, 540));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            machine.state(),
            SessionState::Transferring { from: Owner::Local, to: Owner::Node(_), .. }
        ));
        // Still owned locally until the ack
        assert_eq!(machine.owner(), Owner::Local);

        let id = transfer_id_of(&actions);
        let actions = machine.on_control("b", &ControlMessage::TransferAck { transfer_id: id }, &registry, Instant::now());
        assert_eq!(machine.owner(), Owner::Node("b".to_string()));
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0], Action::SuppressLocal(true));
        match &actions[1] {
            Action::Send(node, Message::Input(InputEvent::MouseMove(m))) => {
                assert_eq!(node, "b");
                assert_eq!((m.x, m.y), (Some(0), Some(540)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_crossing_to_unlinked_node_clamps() {
        let registry = registry_with("b", LayoutPosition::Right, NodeStatus::Discovered);
        let mut machine = started();

        let actions = push_right(&mut machine, &registry, 300);
        assert_eq!(actions, vec![Action::Clamp((1919, 300))]);
        assert_eq!(machine.state(), &SessionState::Owned(Owner::Local));
    }

    #[test]
    fn test_crossing_empty_edge_does_nothing() {
        let registry = registry_with("b", LayoutPosition::Left, NodeStatus::Linked);
        let mut machine = started();
        assert!(push_right(&mut machine, &registry, 300).is_empty());
        assert_eq!(machine.state(), &SessionState::Owned(Owner::Local));
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let registry = registry_with("b", LayoutPosition::Right, NodeStatus::Linked);
        let mut machine = started();
        let id = transfer_id_of(&push_right(&mut machine, &registry, 10));

        let now = Instant::now();
        assert!(machine
            .on_control("b", &ControlMessage::TransferAck { transfer_id: id + 1 }, &registry, now)
            .is_empty());
        assert!(machine
            .on_control("c", &ControlMessage::TransferAck { transfer_id: id }, &registry, now)
            .is_empty());
        assert!(machine.state().is_transferring());
    }

    #[test]
    fn test_reject_returns_to_local() {
        let registry = registry_with("b", LayoutPosition::Right, NodeStatus::Linked);
        let mut machine = started();
        let id = transfer_id_of(&push_right(&mut machine, &registry, 10));

        machine.on_control(
            "b",
            &ControlMessage::TransferReject { transfer_id: id, reason: "busy".to_string() },
            &registry,
            Instant::now(),
        );
        assert_eq!(machine.state(), &SessionState::Owned(Owner::Local));

        // Resting on the edge afterwards does not retry
        let actions = machine.on_cursor(CursorSample { x: 1919, y: 10, dx: 0, dy: 1 }, &registry, Instant::now());
        assert!(actions.is_empty());
    }

    #[test]
    fn test_ack_after_node_unlinked_keeps_local() {
        let mut registry = registry_with("b", LayoutPosition::Right, NodeStatus::Linked);
        let mut machine = started();
        let id = transfer_id_of(&push_right(&mut machine, &registry, 10));

        registry.mark_lost("b").unwrap();
        machine.on_control("b", &ControlMessage::TransferAck { transfer_id: id }, &registry, Instant::now());
        assert_eq!(machine.owner(), Owner::Local);
    }

    #[test]
    fn test_return_request_hands_back() {
        let (mut machine, registry) = owned_by_b();

        let actions = machine.on_control(
            "b",
            &ControlMessage::ReturnRequest { edge: ScreenEdge::Left, along: 700 },
            &registry,
            Instant::now(),
        );
        assert_eq!(
            actions,
            vec![
                Action::Send("b".to_string(), Message::Control(ControlMessage::ReturnAck)),
                Action::SuppressLocal(false),
                Action::Warp((1918, 700)),
            ]
        );
        assert!(matches!(
            machine.state(),
            SessionState::Transferring { to: Owner::Local, .. }
        ));
        assert_eq!(machine.owner(), Owner::Node("b".to_string()));

        machine.complete_return();
        assert_eq!(machine.state(), &SessionState::Owned(Owner::Local));
    }

    #[test]
    fn test_edge_round_trip_lands_inside_controller() {
        let (mut machine, registry) = owned_by_b();
        // b entered at (0, 540); moving straight back out through its left edge
        let actions = machine.on_control(
            "b",
            &ControlMessage::ReturnRequest { edge: ScreenEdge::Left, along: 540 },
            &registry,
            Instant::now(),
        );
        let warp = actions
            .iter()
            .find_map(|a| match a {
                Action::Warp(p) => Some(*p),
                _ => None,
            })
            .unwrap();
        assert!(SCREEN.contains(warp.0, warp.1));
        assert_eq!(warp, (1918, 540));
    }

    #[test]
    fn test_return_request_from_non_owner_ignored() {
        let (mut machine, registry) = owned_by_b();
        let actions = machine.on_control(
            "c",
            &ControlMessage::ReturnRequest { edge: ScreenEdge::Left, along: 0 },
            &registry,
            Instant::now(),
        );
        assert!(actions.is_empty());
        assert_eq!(machine.owner(), Owner::Node("b".to_string()));
    }

    #[test]
    fn test_link_lost_while_owner_recovers_locally() {
        let (mut machine, _registry) = owned_by_b();

        let actions = machine.on_link_lost("b");
        assert_eq!(machine.state(), &SessionState::Owned(Owner::Local));
        assert_eq!(
            actions,
            vec![Action::SuppressLocal(false), Action::Warp(SCREEN.centre())]
        );
    }

    #[test]
    fn test_link_lost_for_other_node_is_ignored() {
        let (mut machine, _registry) = owned_by_b();
        assert!(machine.on_link_lost("c").is_empty());
        assert_eq!(machine.owner(), Owner::Node("b".to_string()));
    }

    #[test]
    fn test_link_lost_during_transfer() {
        let registry = registry_with("b", LayoutPosition::Right, NodeStatus::Linked);
        let mut machine = started();
        push_right(&mut machine, &registry, 10);
        machine.on_link_lost("b");
        assert_eq!(machine.state(), &SessionState::Owned(Owner::Local));
    }

    #[test]
    fn test_transfer_times_out() {
        let registry = registry_with("b", LayoutPosition::Right, NodeStatus::Linked);
        let mut machine = started();
        push_right(&mut machine, &registry, 10);

        let started_at = match machine.state() {
            SessionState::Transferring { started, .. } => *started,
            other => panic!("unexpected {}", other),
        };
        assert!(machine.on_tick(started_at + Duration::from_millis(10)).is_empty());
        assert!(machine.state().is_transferring());

        let actions = machine.on_tick(started_at + Duration::from_secs(2));
        assert_eq!(
            actions,
            vec![Action::Send("b".to_string(), Message::Control(ControlMessage::Revoke))]
        );
        assert_eq!(machine.state(), &SessionState::Owned(Owner::Local));
    }

    #[test]
    fn test_reclaim_sends_revoke() {
        let (mut machine, _registry) = owned_by_b();
        let actions = machine.reclaim();
        assert_eq!(machine.state(), &SessionState::Owned(Owner::Local));
        assert_eq!(
            actions[0],
            Action::Send("b".to_string(), Message::Control(ControlMessage::Revoke))
        );
        assert!(actions.contains(&Action::SuppressLocal(false)));
        assert!(machine.reclaim().is_empty());
    }

    #[test]
    fn test_shutdown_from_node_owner() {
        let (mut machine, _registry) = owned_by_b();
        let actions = machine.shutdown();
        assert_eq!(machine.state(), &SessionState::Idle);
        assert_eq!(machine.owner(), Owner::Local);
        assert!(actions.contains(&Action::SuppressLocal(false)));
        assert!(actions.contains(&Action::Send(
            "b".to_string(),
            Message::Control(ControlMessage::Revoke)
        )));
    }

    #[test]
    fn test_owner_only_ever_linked_node_or_local() {
        // Pseudo-random walk over every operation; the owner must always be
        // Local or a node the registry reports as linked.
        let mut registry = registry_with("b", LayoutPosition::Right, NodeStatus::Linked);
        let mut machine = started();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut last_id = 0;
        let mut now = Instant::now();

        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            now += Duration::from_millis(seed % 300);

            let actions = match seed % 9 {
                0 | 1 => {
                    let x = if seed % 2 == 0 { 1919 } else { 1000 };
                    machine.on_cursor(CursorSample { x, y: 500, dx: 1, dy: 0 }, &registry, now)
                }
                2 => machine.on_control("b", &ControlMessage::TransferAck { transfer_id: last_id }, &registry, now),
                3 => machine.on_control(
                    "b",
                    &ControlMessage::ReturnRequest { edge: ScreenEdge::Left, along: 500 },
                    &registry,
                    now,
                ),
                4 => machine.complete_return(),
                5 => {
                    registry.mark_lost("b").unwrap();
                    machine.on_link_lost("b")
                }
                6 => {
                    registry.set_status("b", NodeStatus::Linked).unwrap();
                    Vec::new()
                }
                7 => machine.on_tick(now),
                _ => machine.reclaim(),
            };
            for action in &actions {
                if let Action::Send(_, Message::Control(ControlMessage::TransferRequest { transfer_id, .. })) = action {
                    last_id = *transfer_id;
                }
            }

            match machine.owner() {
                Owner::Local => {}
                Owner::Node(id) => assert!(registry.get(&id).unwrap().is_linked()),
            }
            assert_ne!(machine.state(), &SessionState::Idle);
        }
    }
}
