//! Controller service loop
//!
//! One task owns the registry, the session machine and the outbound router.
//! Captured input, discovery sightings, link traffic and a periodic tick all
//! arrive as events on that task, so state is never shared.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use super::machine::{Action, CursorSample, SessionMachine};
use super::state::{Owner, SessionState};
use super::{spawn_link_pump, LinkEvent, ServiceResult};
use crate::config::Config;
use crate::discovery::{Announcement, Discovery, DiscoveryEvent, Role};
use crate::input::{CursorTracker, InputCapture, InputEvent, InputInjector};
use crate::network::{Link, LinkConfig, LinkError, LinkHandle, LinkResult};
use crate::protocol::{Message, ScreenInfo};
use crate::registry::{LayoutPosition, NodeCandidate, NodeId, NodeRegistry, NodeStatus};
use crate::router::{OutboundRouter, Route};

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Published after every event the controller handles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub owner: Owner,
    /// Nodes with an established link, sorted
    pub linked: Vec<NodeId>,
}

enum ServiceEvent {
    Connected {
        node: NodeId,
        result: LinkResult<Link>,
    },
    Link(LinkEvent),
}

struct ActiveLink {
    handle: LinkHandle,
    generation: u64,
}

/// Owns input on the machine with the keyboard and mouse
pub struct Controller {
    local: ScreenInfo,
    token: String,
    link_config: LinkConfig,
    reconnect_interval: Duration,
    lost_after: Duration,
    forget_after: Duration,
    registry: NodeRegistry,
    machine: SessionMachine,
    router: OutboundRouter,
    cursor: CursorTracker,
    capture: Box<dyn InputCapture>,
    injector: Box<dyn InputInjector>,
    discovery: Option<Discovery>,
    links: HashMap<NodeId, ActiveLink>,
    last_attempt: HashMap<NodeId, Instant>,
    next_generation: u64,
    events_tx: mpsc::Sender<ServiceEvent>,
    events_rx: mpsc::Receiver<ServiceEvent>,
    status_tx: watch::Sender<ControllerStatus>,
}

impl Controller {
    pub fn new(
        config: &mut Config,
        capture: Box<dyn InputCapture>,
        injector: Box<dyn InputInjector>,
    ) -> ServiceResult<Self> {
        let local = config.local_screen();
        let registry = config.peer_registry(Instant::now())?;
        let discovery = if config.network.enable_discovery {
            let announcement = Announcement::new(&local, Role::Controller, config.network.link_port);
            Some(Discovery::new(config.discovery_config()?, announcement))
        } else {
            None
        };

        let screen = config.screen_rect();
        let link_config = config.link_config();
        let (events_tx, events_rx) = mpsc::channel(link_config.send_queue.max(1));
        let (status_tx, _) = watch::channel(ControllerStatus {
            owner: Owner::Local,
            linked: Vec::new(),
        });
        let n = &config.network;

        Ok(Self {
            token: config.security.token.clone(),
            reconnect_interval: Duration::from_millis(n.reconnect_interval_ms),
            lost_after: Duration::from_millis(n.node_lost_after_ms),
            forget_after: Duration::from_millis(n.node_forget_after_ms),
            machine: SessionMachine::new(config.session_config()),
            router: OutboundRouter::new(config.router_config()),
            cursor: CursorTracker::new(screen.width, screen.height),
            local,
            link_config,
            registry,
            capture,
            injector,
            discovery,
            links: HashMap::new(),
            last_attempt: HashMap::new(),
            next_generation: 0,
            events_tx,
            events_rx,
            status_tx,
        })
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn status(&self) -> watch::Receiver<ControllerStatus> {
        self.status_tx.subscribe()
    }

    /// Run until `shutdown` completes. Input is always back with the
    /// controller when this returns.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> ServiceResult<()> {
        let mut captured = self.capture.start().await?;
        let mut capture_open = true;

        let (discovery_tx, mut discovery_rx) = mpsc::channel(64);
        if let Some(discovery) = self.discovery.as_mut() {
            discovery.start(discovery_tx);
        } else {
            drop(discovery_tx);
        }

        self.machine.start();
        tracing::info!(
            id = %self.local.node_id,
            screen = %format!("{}x{}", self.local.width, self.local.height),
            nodes = self.registry.len(),
            "controller ready"
        );
        self.connect_due(Instant::now());
        self.publish();

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                event = captured.recv(), if capture_open => match event {
                    Some(event) => self.on_captured(event).await,
                    None => {
                        tracing::warn!("input capture ended");
                        capture_open = false;
                    }
                },
                Some(event) = self.events_rx.recv() => self.on_event(event).await,
                Some(event) = discovery_rx.recv() => self.on_discovery(event),
                _ = ticker.tick() => self.on_tick().await,
                _ = &mut shutdown => break,
            }
            self.publish();
        }

        self.stop().await;
        Ok(())
    }

    fn publish(&self) {
        let mut linked: Vec<NodeId> = self.links.keys().cloned().collect();
        linked.sort();
        let next = ControllerStatus {
            owner: self.machine.owner(),
            linked,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    async fn on_captured(&mut self, event: InputEvent) {
        let mut actions = Vec::new();
        if let InputEvent::MouseMove(movement) = &event {
            if self.machine.state() == &SessionState::Owned(Owner::Local) {
                let (before_x, before_y) = (self.cursor.x, self.cursor.y);
                let (x, y) = self.cursor.apply(movement);
                let (dx, dy) = match (movement.x, movement.y) {
                    (Some(_), Some(_)) => (x - before_x, y - before_y),
                    _ => (movement.dx, movement.dy),
                };
                actions = self
                    .machine
                    .on_cursor(CursorSample { x, y, dx, dy }, &self.registry, Instant::now());
            }
        }

        match self.router.route(event, &self.machine.owner()) {
            Route::Local => {}
            Route::Forward { node, event, .. } => {
                let result = match self.links.get(&node) {
                    Some(link) => link.handle.try_send(Message::Input(event)),
                    None => Err(LinkError::Closed),
                };
                if let Err(e) = result {
                    tracing::warn!(%node, error = %e, "forwarding failed, dropping link");
                    actions.extend(self.lose_link(&node));
                }
            }
            Route::Hotkey => {
                let reclaimed = self.machine.reclaim();
                actions.extend(self.with_releases(reclaimed));
            }
        }

        self.apply(actions).await;
    }

    async fn on_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::Connected { node, result } => self.on_connected(node, result).await,
            ServiceEvent::Link(LinkEvent::Frame {
                node,
                generation,
                frame,
            }) => {
                if !self.is_current(&node, generation) {
                    return;
                }
                let now = Instant::now();
                self.registry.touch(&node, now);
                match frame.message {
                    Message::Control(control) => {
                        let mut actions = self.machine.on_control(&node, &control, &self.registry, now);
                        if matches!(
                            self.machine.state(),
                            SessionState::Transferring { to: Owner::Local, .. }
                        ) {
                            // ReturnAck is queued ahead of anything else
                            actions.extend(self.machine.complete_return());
                        }
                        let actions = self.with_releases(actions);
                        self.apply(actions).await;
                    }
                    other => {
                        tracing::debug!(%node, kind = ?other.kind(), "ignoring frame from node");
                    }
                }
            }
            ServiceEvent::Link(LinkEvent::Closed {
                node,
                generation,
                reason,
            }) => {
                if !self.is_current(&node, generation) {
                    tracing::debug!(%node, %reason, "replaced link closed");
                    return;
                }
                if reason.is_lost() {
                    tracing::warn!(%node, %reason, "link lost");
                } else {
                    tracing::info!(%node, %reason, "link closed");
                }
                let actions = self.lose_link(&node);
                self.apply(actions).await;
            }
        }
    }

    async fn on_connected(&mut self, node: NodeId, result: LinkResult<Link>) {
        let link = match result {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(%node, error = %e, "link attempt failed");
                let status = match e {
                    // Reachable, but will not link until configuration changes
                    LinkError::Authentication | LinkError::VersionMismatch { .. } => {
                        NodeStatus::Discovered
                    }
                    _ => NodeStatus::Lost,
                };
                self.set_node_status(&node, status);
                return;
            }
        };

        if link.node_id() != node {
            tracing::warn!(expected = %node, got = %link.node_id(), "linked to an unexpected node");
            self.set_node_status(&node, NodeStatus::Lost);
            tokio::spawn(async move { link.close("unexpected node id").await });
            return;
        }

        if self.links.contains_key(&node) {
            let actions = self.lose_link(&node);
            self.apply(actions).await;
        }

        let remote = link.remote().clone();
        let now = Instant::now();
        self.registry.upsert(
            NodeCandidate {
                id: node.clone(),
                name: remote.name.clone(),
                addr: link.addr(),
                screen: Some((remote.width, remote.height)),
            },
            now,
        );
        self.set_node_status(&node, NodeStatus::Linked);
        tracing::info!(
            %node,
            addr = %link.addr(),
            screen = %format!("{}x{}", remote.width, remote.height),
            "node linked"
        );

        self.next_generation += 1;
        let generation = self.next_generation;
        let (handle, receiver) = link.split();
        spawn_link_pump(
            node.clone(),
            generation,
            receiver,
            self.events_tx.clone(),
            ServiceEvent::Link,
        );
        self.links.insert(node, ActiveLink { handle, generation });
    }

    fn on_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Sighting(sighting) => {
                let announcement = &sighting.announcement;
                if announcement.role != Role::Node {
                    tracing::trace!(id = %announcement.node_id, role = %announcement.role, "ignoring announcement");
                    return;
                }
                if !announcement.is_compatible() {
                    tracing::debug!(
                        id = %announcement.node_id,
                        version = announcement.protocol_version,
                        "ignoring incompatible node"
                    );
                    return;
                }
                self.registry.upsert(sighting.to_candidate(), sighting.seen_at);
            }
            DiscoveryEvent::Inactive(e) => {
                tracing::debug!(error = %e, "discovery inactive");
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let actions = self.machine.on_tick(now);
        let actions = self.with_releases(actions);
        self.apply(actions).await;

        self.registry.sweep(now, self.lost_after, self.forget_after);
        self.connect_due(now);
    }

    fn is_current(&self, node: &str, generation: u64) -> bool {
        self.links.get(node).map(|l| l.generation) == Some(generation)
    }

    /// Start links to laid-out nodes that have none and are due a retry
    fn connect_due(&mut self, now: Instant) {
        let due: Vec<(NodeId, SocketAddr)> = self
            .registry
            .all()
            .filter(|n| n.position != LayoutPosition::None)
            .filter(|n| !matches!(n.status, NodeStatus::Linked | NodeStatus::Linking))
            .filter(|n| {
                self.last_attempt
                    .get(&n.id)
                    .map_or(true, |at| now.saturating_duration_since(*at) >= self.reconnect_interval)
            })
            .map(|n| (n.id.clone(), n.addr))
            .collect();

        for (node, addr) in due {
            self.last_attempt.insert(node.clone(), now);
            self.set_node_status(&node, NodeStatus::Linking);
            tracing::debug!(%node, %addr, "linking");

            let local = self.local.clone();
            let token = self.token.clone();
            let config = self.link_config.clone();
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                let result = Link::connect(addr, &local, &token, &config).await;
                let _ = events.send(ServiceEvent::Connected { node, result }).await;
            });
        }
    }

    /// Put releases for anything still held on a node ahead of `actions`
    /// once that node no longer owns input
    fn with_releases(&mut self, actions: Vec<Action>) -> Vec<Action> {
        if !self.machine.owner().is_local() {
            return actions;
        }
        let Some((node, releases)) = self.router.release_held() else {
            return actions;
        };
        if !self.links.contains_key(&node) {
            return actions;
        }
        releases
            .into_iter()
            .map(|event| Action::Send(node.clone(), Message::Input(event)))
            .chain(actions)
            .collect()
    }

    fn set_node_status(&mut self, node: &str, status: NodeStatus) {
        if let Err(e) = self.registry.set_status(node, status) {
            tracing::debug!(%node, %status, error = %e, "status update skipped");
        }
    }

    /// Drop `node`'s link and recover the session
    fn lose_link(&mut self, node: &str) -> Vec<Action> {
        if let Some(link) = self.links.remove(node) {
            let handle = link.handle;
            tokio::spawn(async move { handle.close("link dropped by controller").await });
        }
        self.set_node_status(node, NodeStatus::Lost);
        let actions = self.machine.on_link_lost(node);
        self.with_releases(actions)
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send(node, message) => {
                    let Some(link) = self.links.get(&node) else {
                        tracing::debug!(%node, kind = ?message.kind(), "no link, message dropped");
                        continue;
                    };
                    let result = link.handle.send(message).await;
                    if let Err(e) = result {
                        tracing::warn!(%node, error = %e, "send failed, dropping link");
                        queue.extend(self.lose_link(&node));
                    }
                }
                Action::Clamp((x, y)) => self.cursor.set(x, y),
                Action::SuppressLocal(suppress) => {
                    if self.capture.is_suppressing() != suppress {
                        tracing::debug!(suppress, "local input suppression");
                    }
                    self.capture.set_suppress(suppress);
                }
                Action::Warp((x, y)) => {
                    self.cursor.set(x, y);
                    if let Err(e) = self.injector.warp(x, y).await {
                        tracing::warn!(error = %e, "cursor warp failed");
                    }
                }
            }
        }
    }

    async fn stop(&mut self) {
        let actions = self.machine.shutdown();
        let actions = self.with_releases(actions);
        self.apply(actions).await;

        for (node, link) in self.links.drain() {
            link.handle.close("controller shutting down").await;
            tracing::debug!(%node, "link closed");
        }
        if let Some(discovery) = self.discovery.as_mut() {
            discovery.stop().await;
        }
        if let Err(e) = self.capture.stop().await {
            tracing::debug!(error = %e, "capture stop");
        }
        self.publish();
        tracing::info!("controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::input::{keycodes, ChannelCapture, InputResult};
    use crate::session::NodeService;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recording {
        events: Arc<Mutex<Vec<InputEvent>>>,
        warps: Arc<Mutex<Vec<(i32, i32)>>>,
    }

    #[async_trait]
    impl InputInjector for Recording {
        async fn inject(&mut self, event: &InputEvent) -> InputResult<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn warp(&mut self, x: i32, y: i32) -> InputResult<()> {
            self.warps.lock().unwrap().push((x, y));
            Ok(())
        }
    }

    fn base_config(id: &str) -> Config {
        let mut config = Config::default();
        config.general.node_id = Some(id.to_string());
        config.general.name = id.to_string();
        config.network.bind_address = Some("127.0.0.1".to_string());
        config.network.enable_discovery = false;
        config.security.token = "secret".to_string();
        config
    }

    async fn wait_status(
        status: &mut watch::Receiver<ControllerStatus>,
        what: impl Fn(&ControllerStatus) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(3), status.wait_for(|s| what(s)))
            .await
            .expect("controller status")
            .unwrap();
    }

    #[tokio::test]
    async fn test_handoff_round_trip_and_recovery() {
        let node_input = Recording::default();
        let mut node_config = base_config("node-b");
        node_config.screen.width = Some(1280);
        node_config.screen.height = Some(720);
        node_config.network.link_port = 0;
        let node = NodeService::bind(&mut node_config, Box::new(node_input.clone()))
            .await
            .unwrap();
        let node_addr = node.local_addr();
        let (node_stop_tx, node_stop_rx) = tokio::sync::oneshot::channel::<()>();
        let node_task = tokio::spawn(node.run(async {
            let _ = node_stop_rx.await;
        }));

        let mut config = base_config("ctrl");
        config.screen.width = Some(1920);
        config.screen.height = Some(1080);
        config.peers.push(PeerConfig {
            id: "node-b".to_string(),
            name: None,
            address: node_addr.to_string(),
            position: LayoutPosition::Right,
        });
        let (capture, feed) = ChannelCapture::new();
        let local_input = Recording::default();
        let controller = Controller::new(&mut config, Box::new(capture), Box::new(local_input.clone())).unwrap();
        let mut status = controller.status();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let controller_task = tokio::spawn(controller.run(async {
            let _ = stop_rx.await;
        }));

        wait_status(&mut status, |s| s.linked == vec!["node-b".to_string()]).await;

        // Cross the right edge
        feed.send(InputEvent::mouse_to(960, 540)).await.unwrap();
        feed.send(InputEvent::mouse_delta(2000, 0)).await.unwrap();
        wait_status(&mut status, |s| s.owner == Owner::Node("node-b".to_string())).await;

        feed.send(InputEvent::key(keycodes::KEY_A, true)).await.unwrap();
        feed.send(InputEvent::key(keycodes::KEY_A, false)).await.unwrap();

        // Push back through the node's left edge
        feed.send(InputEvent::mouse_delta(-3000, 0)).await.unwrap();
        wait_status(&mut status, |s| s.owner == Owner::Local).await;
        {
            let events = node_input.events.lock().unwrap();
            assert!(events
                .iter()
                .any(|e| matches!(e, InputEvent::Keyboard(k) if k.keycode == keycodes::KEY_A && k.pressed)));
        }
        let returned = *local_input.warps.lock().unwrap().last().unwrap();
        assert_eq!(returned.0, 1918);

        // Cross again, then lose the node
        feed.send(InputEvent::mouse_delta(50, 0)).await.unwrap();
        wait_status(&mut status, |s| s.owner == Owner::Node("node-b".to_string())).await;

        let _ = node_stop_tx.send(());
        node_task.await.unwrap().unwrap();
        wait_status(&mut status, |s| s.owner == Owner::Local && s.linked.is_empty()).await;
        assert_eq!(*local_input.warps.lock().unwrap().last().unwrap(), (960, 540));

        let _ = stop_tx.send(());
        tokio_test::assert_ok!(controller_task.await.unwrap());
    }

    #[tokio::test]
    async fn test_unlinked_node_does_not_take_input() {
        let mut config = base_config("ctrl");
        config.screen.width = Some(1920);
        config.screen.height = Some(1080);
        // Nothing listens here
        config.peers.push(PeerConfig {
            id: "ghost".to_string(),
            name: None,
            address: "127.0.0.1:1".to_string(),
            position: LayoutPosition::Right,
        });
        let (capture, feed) = ChannelCapture::new();
        let local_input = Recording::default();
        let controller = Controller::new(&mut config, Box::new(capture), Box::new(local_input.clone())).unwrap();
        let status = controller.status();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(controller.run(async {
            let _ = stop_rx.await;
        }));

        feed.send(InputEvent::mouse_to(960, 540)).await.unwrap();
        feed.send(InputEvent::mouse_delta(2000, 0)).await.unwrap();
        feed.send(InputEvent::key(keycodes::KEY_A, true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(status.borrow().owner, Owner::Local);
        assert!(status.borrow().linked.is_empty());

        let _ = stop_tx.send(());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_attempts_update_known_nodes_only() {
        let mut config = base_config("ctrl");
        config.peers.push(PeerConfig {
            id: "node-b".to_string(),
            name: None,
            address: "127.0.0.1:1".to_string(),
            position: LayoutPosition::Right,
        });
        let (capture, _feed) = ChannelCapture::new();
        let mut controller =
            Controller::new(&mut config, Box::new(capture), Box::new(Recording::default())).unwrap();

        controller
            .on_connected("node-b".to_string(), Err(LinkError::Authentication))
            .await;
        assert_eq!(
            controller.registry().get("node-b").unwrap().status,
            NodeStatus::Discovered
        );

        controller
            .on_connected("node-b".to_string(), Err(LinkError::Timeout("connect")))
            .await;
        assert_eq!(controller.registry().get("node-b").unwrap().status, NodeStatus::Lost);

        // A node the registry has forgotten stays forgotten
        controller
            .on_connected("ghost".to_string(), Err(LinkError::Timeout("connect")))
            .await;
        assert!(controller.registry().get("ghost").is_none());
        assert_eq!(controller.registry().all().count(), 1);
    }
}
