//! Node side of a session
//!
//! `PeerSession` tracks whether this node currently holds input and when the
//! cursor should go back. `NodeService` accepts links from controllers,
//! injects what they forward and answers their handoff requests.

use std::future::Future;
use std::net::SocketAddr;

use tokio::sync::{mpsc, watch};

use super::{spawn_link_pump, LinkEvent, ServiceResult};
use crate::config::Config;
use crate::discovery::{Announcement, Discovery, DiscoveryEvent, Role};
use crate::input::{CursorTracker, InputEvent, InputInjector};
use crate::network::{LinkHandle, Listener, ListenerEvent};
use crate::protocol::{ControlMessage, Message, ScreenEdge, ScreenInfo};
use crate::registry::NodeId;
use crate::router::InboundRouter;
use crate::screen::{EdgeDetectResult, EdgeDetector, EdgeDetectorConfig, EdgeMask, ScreenRect};

/// Something the node service must do for the session
#[derive(Debug, Clone, PartialEq)]
pub enum PeerAction {
    /// Queue a message to the controller
    Send(Message),
    /// Move the local cursor
    Warp((i32, i32)),
    /// Release everything the controller left pressed
    ReleaseHeld,
}

/// Whether this node holds input, and where its way back is
pub struct PeerSession {
    screen: ScreenRect,
    cursor: CursorTracker,
    detector: EdgeDetector,
    /// Edge facing the controller for the current hold
    facing: Option<ScreenEdge>,
    controlled: bool,
    return_pending: bool,
}

impl PeerSession {
    pub fn new(screen: ScreenRect, mut edges: EdgeDetectorConfig) -> Self {
        edges.enabled_edges = EdgeMask::NONE;
        Self {
            screen,
            cursor: CursorTracker::new(screen.width, screen.height),
            detector: EdgeDetector::new(edges, screen.width, screen.height),
            facing: None,
            controlled: false,
            return_pending: false,
        }
    }

    pub fn is_controlled(&self) -> bool {
        self.controlled
    }

    pub fn cursor(&self) -> (i32, i32) {
        (self.cursor.x, self.cursor.y)
    }

    fn release(&mut self) {
        self.controlled = false;
        self.return_pending = false;
        self.facing = None;
        self.detector.reset();
        self.detector.set_enabled_edges(EdgeMask::NONE);
    }

    /// A control message from the controller
    pub fn on_control(&mut self, message: &ControlMessage) -> Vec<PeerAction> {
        match message {
            ControlMessage::TransferRequest {
                transfer_id,
                edge,
                x,
                y,
            } => {
                let (x, y) = self.screen.clamp(*x, *y);
                self.cursor.set(x, y);
                self.facing = Some(*edge);
                self.detector.set_enabled_edges(std::iter::once(*edge).collect());
                self.detector.settle_at(*edge);
                self.controlled = true;
                self.return_pending = false;
                tracing::info!(transfer_id, %edge, x, y, "input handed to this node");
                vec![
                    PeerAction::Warp((x, y)),
                    PeerAction::Send(Message::Control(ControlMessage::TransferAck {
                        transfer_id: *transfer_id,
                    })),
                ]
            }
            ControlMessage::ReturnAck | ControlMessage::Revoke => {
                if !self.controlled {
                    return Vec::new();
                }
                tracing::info!(message = ?message, "input returned to controller");
                self.release();
                vec![PeerAction::ReleaseHeld]
            }
            ControlMessage::Disconnect { .. } => Vec::new(),
            other => {
                tracing::debug!(message = ?other, "unexpected control message on node");
                Vec::new()
            }
        }
    }

    /// Forwarded input that has just been injected
    pub fn on_input(&mut self, event: &InputEvent) -> Vec<PeerAction> {
        let InputEvent::MouseMove(movement) = event else {
            return Vec::new();
        };
        if !self.controlled {
            return Vec::new();
        }

        let (before_x, before_y) = (self.cursor.x, self.cursor.y);
        let (x, y) = self.cursor.apply(movement);
        let (dx, dy) = match (movement.x, movement.y) {
            (Some(_), Some(_)) => (x - before_x, y - before_y),
            _ => (movement.dx, movement.dy),
        };

        match self.detector.check(x, y, dx, dy) {
            EdgeDetectResult::Transition { edge, along }
                if Some(edge) == self.facing && !self.return_pending =>
            {
                self.return_pending = true;
                tracing::info!(%edge, along, "cursor left toward the controller");
                vec![PeerAction::Send(Message::Control(ControlMessage::ReturnRequest {
                    edge,
                    along,
                }))]
            }
            EdgeDetectResult::NotAtEdge => {
                // Away from the edge again; a later push may ask again
                self.return_pending = false;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// The controller's link closed
    pub fn on_link_lost(&mut self) -> Vec<PeerAction> {
        if self.controlled {
            tracing::warn!("controller lost while holding input");
        }
        self.release();
        vec![PeerAction::ReleaseHeld]
    }
}

struct ActiveLink {
    controller: NodeId,
    generation: u64,
    handle: LinkHandle,
}

/// Accepts controllers and applies their input on this machine
pub struct NodeService {
    local: ScreenInfo,
    listener: Listener,
    listener_rx: mpsc::Receiver<ListenerEvent>,
    discovery: Option<Discovery>,
    session: PeerSession,
    inbound: InboundRouter,
    active: Option<ActiveLink>,
    next_generation: u64,
    events_tx: mpsc::Sender<LinkEvent>,
    events_rx: mpsc::Receiver<LinkEvent>,
    controlled_tx: watch::Sender<bool>,
}

impl NodeService {
    /// Bind the link listener. Discovery starts with `run`.
    pub async fn bind(config: &mut Config, injector: Box<dyn InputInjector>) -> ServiceResult<Self> {
        let local = config.local_screen();
        let link_config = config.link_config();
        let (listener_tx, listener_rx) = mpsc::channel(16);
        let listener = Listener::bind(
            config.link_bind_addr()?,
            local.clone(),
            config.security.token.clone(),
            link_config.clone(),
            listener_tx,
        )
        .await?;

        let discovery = if config.network.enable_discovery {
            let announcement = Announcement::new(&local, Role::Node, listener.local_addr().port());
            Some(Discovery::new(config.discovery_config()?, announcement))
        } else {
            None
        };

        let (events_tx, events_rx) = mpsc::channel(link_config.send_queue.max(1));
        let (controlled_tx, _) = watch::channel(false);

        Ok(Self {
            session: PeerSession::new(config.screen_rect(), config.edge_config()),
            inbound: InboundRouter::new(injector),
            local,
            listener,
            listener_rx,
            discovery,
            active: None,
            next_generation: 0,
            events_tx,
            events_rx,
            controlled_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Observe whether this node holds input
    pub fn controlled(&self) -> watch::Receiver<bool> {
        self.controlled_tx.subscribe()
    }

    /// Serve until `shutdown` completes
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> ServiceResult<()> {
        let (discovery_tx, mut discovery_rx) = mpsc::channel(64);
        if let Some(discovery) = self.discovery.as_mut() {
            discovery.start(discovery_tx);
        } else {
            drop(discovery_tx);
        }
        tracing::info!(
            id = %self.local.node_id,
            addr = %self.listener.local_addr(),
            "node ready"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                Some(event) = self.listener_rx.recv() => self.on_listener(event).await,
                Some(event) = self.events_rx.recv() => self.on_link_event(event).await,
                Some(event) = discovery_rx.recv() => match event {
                    DiscoveryEvent::Sighting(sighting) => {
                        tracing::trace!(id = %sighting.announcement.node_id, "announcement seen");
                    }
                    DiscoveryEvent::Inactive(e) => {
                        tracing::debug!(error = %e, "discovery inactive");
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        self.stop().await;
        Ok(())
    }

    async fn on_listener(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Accepted(link) => {
                if let Some(previous) = self.active.take() {
                    tracing::info!(
                        previous = %previous.controller,
                        next = %link.node_id(),
                        "replacing controller link"
                    );
                    self.end_session().await;
                    tokio::spawn(async move {
                        previous.handle.close("replaced by a newer link").await;
                    });
                }

                self.next_generation += 1;
                let generation = self.next_generation;
                let controller = link.node_id().to_string();
                tracing::info!(%controller, addr = %link.addr(), "controller linked");

                self.inbound.reset_link();
                let (handle, receiver) = link.split();
                spawn_link_pump(controller.clone(), generation, receiver, self.events_tx.clone(), |e| e);
                self.active = Some(ActiveLink {
                    controller,
                    generation,
                    handle,
                });
            }
            ListenerEvent::Rejected { addr, error } => {
                tracing::debug!(%addr, error = %error, "handshake failed");
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active.as_ref().map(|a| a.generation) == Some(generation)
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame {
                generation, frame, ..
            } => {
                if !self.is_current(generation) {
                    return;
                }
                let movement = match &frame.message {
                    Message::Input(event @ InputEvent::MouseMove(_)) => Some(event.clone()),
                    _ => None,
                };
                let actions = match self.inbound.handle(frame, self.session.is_controlled()).await {
                    Some(control) => self.session.on_control(&control),
                    None => movement
                        .map(|event| self.session.on_input(&event))
                        .unwrap_or_default(),
                };
                self.apply(actions).await;
            }
            LinkEvent::Closed {
                node,
                generation,
                reason,
            } => {
                if !self.is_current(generation) {
                    tracing::debug!(%node, %reason, "replaced link closed");
                    return;
                }
                self.active = None;
                tracing::warn!(controller = %node, %reason, "controller link closed");
                self.end_session().await;
            }
        }
    }

    async fn end_session(&mut self) {
        let actions = self.session.on_link_lost();
        self.apply(actions).await;
        self.inbound.reset_link();
    }

    async fn apply(&mut self, actions: Vec<PeerAction>) {
        for action in actions {
            match action {
                PeerAction::Send(message) => {
                    let Some(active) = &self.active else {
                        continue;
                    };
                    if let Err(e) = active.handle.send(message).await {
                        tracing::warn!(controller = %active.controller, error = %e, "send to controller failed");
                    }
                }
                PeerAction::Warp((x, y)) => self.inbound.warp(x, y).await,
                PeerAction::ReleaseHeld => self.inbound.release_all().await,
            }
        }
        let now = self.session.is_controlled();
        self.controlled_tx.send_if_modified(|controlled| {
            let changed = *controlled != now;
            *controlled = now;
            changed
        });
    }

    async fn stop(&mut self) {
        self.end_session().await;
        if let Some(active) = self.active.take() {
            active.handle.close("node shutting down").await;
        }
        self.listener.stop().await;
        if let Some(discovery) = self.discovery.as_mut() {
            discovery.stop().await;
        }
        tracing::info!("node stopped");
    }
}
