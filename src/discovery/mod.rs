//! Service discovery module
//!
//! Every instance periodically sends a small JSON announcement over UDP:
//! broadcast to the configured broadcast address, and unicast to each static
//! target for networks that drop broadcast. The same socket receives other
//! instances' announcements and reports them as sightings.
//!
//! Discovery failures are never fatal. If the socket cannot be bound or a
//! broadcast fails, an `Inactive` event is emitted and the loop retries
//! after `retry_interval`; configured peers keep working meanwhile.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::protocol::{ScreenInfo, PROTOCOL_VERSION};
use crate::registry::NodeCandidate;

/// Marker carried in every announcement
pub const ANNOUNCE_MAGIC: &str = "edgeshare";

/// Largest datagram we read
const MAX_DATAGRAM: usize = 2048;

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send announcement to {addr}: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("recv error: {0}")]
    Recv(std::io::Error),

    #[error("malformed announcement: {0}")]
    Malformed(String),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// What the announcing instance does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Controller,
    Node,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Controller => f.write_str("controller"),
            Role::Node => f.write_str("node"),
        }
    }
}

/// Presence announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub magic: String,
    pub node_id: String,
    pub name: String,
    pub role: Role,
    pub protocol_version: u32,
    pub link_port: u16,
    pub width: u32,
    pub height: u32,
}

impl Announcement {
    pub fn new(screen: &ScreenInfo, role: Role, link_port: u16) -> Self {
        Self {
            magic: ANNOUNCE_MAGIC.to_string(),
            node_id: screen.node_id.clone(),
            name: screen.name.clone(),
            role,
            protocol_version: PROTOCOL_VERSION,
            link_port,
            width: screen.width,
            height: screen.height,
        }
    }

    pub fn to_bytes(&self) -> DiscoveryResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| DiscoveryError::Malformed(e.to_string()))
    }

    /// Parse a datagram, rejecting anything without our magic
    pub fn parse(datagram: &[u8]) -> DiscoveryResult<Self> {
        let announcement: Announcement = serde_json::from_slice(datagram)
            .map_err(|e| DiscoveryError::Malformed(e.to_string()))?;
        if announcement.magic != ANNOUNCE_MAGIC {
            return Err(DiscoveryError::Malformed(format!(
                "unexpected magic {:?}",
                announcement.magic
            )));
        }
        Ok(announcement)
    }

    pub fn is_compatible(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }
}

/// One received announcement
#[derive(Debug, Clone)]
pub struct Sighting {
    pub announcement: Announcement,
    /// Source address of the datagram
    pub observed_addr: SocketAddr,
    pub seen_at: Instant,
}

impl Sighting {
    /// Where the announcer accepts links
    pub fn link_addr(&self) -> SocketAddr {
        SocketAddr::new(self.observed_addr.ip(), self.announcement.link_port)
    }

    pub fn to_candidate(&self) -> NodeCandidate {
        NodeCandidate {
            id: self.announcement.node_id.clone(),
            name: self.announcement.name.clone(),
            addr: self.link_addr(),
            screen: Some((self.announcement.width, self.announcement.height)),
        }
    }
}

/// Events from the discovery service
#[derive(Debug)]
pub enum DiscoveryEvent {
    Sighting(Sighting),
    /// Discovery is paused after a failure and will retry
    Inactive(DiscoveryError),
}

/// Discovery socket settings
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    /// `None` disables broadcast, leaving only static targets
    pub broadcast_address: Option<IpAddr>,
    pub static_targets: Vec<SocketAddr>,
    pub announce_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            port: crate::protocol::DEFAULT_DISCOVERY_PORT,
            broadcast_address: Some(IpAddr::from([255, 255, 255, 255])),
            static_targets: Vec::new(),
            announce_interval: Duration::from_millis(1000),
            retry_interval: Duration::from_millis(2000),
        }
    }
}

/// Service discovery manager
pub struct Discovery {
    config: DiscoveryConfig,
    announcement: Announcement,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig, announcement: Announcement) -> Self {
        Self {
            config,
            announcement,
            shutdown_tx: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Start announcing and listening. Events go to `events` until `stop`.
    pub fn start(&mut self, events: mpsc::Sender<DiscoveryEvent>) {
        if self.is_running() {
            tracing::debug!("discovery already running");
            return;
        }
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        tokio::spawn(discovery_task(
            self.config.clone(),
            self.announcement.clone(),
            events,
            shutdown_rx,
        ));
        tracing::info!(
            port = self.config.port,
            id = %self.announcement.node_id,
            "discovery started"
        );
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

async fn bind(config: &DiscoveryConfig) -> DiscoveryResult<UdpSocket> {
    let addr = SocketAddr::new(config.bind_address, config.port);
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|source| DiscoveryError::Bind { addr, source })?;
    if config.broadcast_address.is_some() {
        socket
            .set_broadcast(true)
            .map_err(|source| DiscoveryError::Bind { addr, source })?;
    }
    Ok(socket)
}

async fn discovery_task(
    config: DiscoveryConfig,
    announcement: Announcement,
    events: mpsc::Sender<DiscoveryEvent>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    loop {
        let result = match bind(&config).await {
            Ok(socket) => {
                if let Ok(local) = socket.local_addr() {
                    tracing::debug!("discovery socket bound on {}", local);
                }
                run(&socket, &config, &announcement, &events, &mut shutdown_rx).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => break,
            Err(e) => {
                tracing::warn!(error = %e, "discovery inactive, retrying in {:?}", config.retry_interval);
                if events.send(DiscoveryEvent::Inactive(e)).await.is_err() {
                    break;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.retry_interval) => {}
            _ = shutdown_rx.recv() => break,
        }
    }
    tracing::info!("discovery stopped");
}

/// Announce and receive until shutdown (`Ok`) or a socket failure (`Err`)
async fn run(
    socket: &UdpSocket,
    config: &DiscoveryConfig,
    announcement: &Announcement,
    events: &mpsc::Sender<DiscoveryEvent>,
    shutdown_rx: &mut mpsc::Receiver<()>,
) -> DiscoveryResult<()> {
    let payload = announcement.to_bytes()?;
    let mut ticker = tokio::time::interval(config.announce_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(ip) = config.broadcast_address {
                    let addr = SocketAddr::new(ip, config.port);
                    socket
                        .send_to(&payload, addr)
                        .await
                        .map_err(|source| DiscoveryError::Send { addr, source })?;
                }
                for target in &config.static_targets {
                    if let Err(e) = socket.send_to(&payload, target).await {
                        tracing::debug!("announcement to {} failed: {}", target, e);
                    }
                }
            }
            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(pair) => pair,
                    // ICMP unreachable from a previous send on some platforms
                    Err(e) if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
                    ) => continue,
                    Err(e) => return Err(DiscoveryError::Recv(e)),
                };

                let Some(sighting) = accept_datagram(&buf[..len], src, &announcement.node_id) else {
                    continue;
                };
                if !sighting.announcement.is_compatible() {
                    tracing::warn!(
                        node = %sighting.announcement.node_id,
                        version = sighting.announcement.protocol_version,
                        "peer speaks an incompatible protocol version"
                    );
                }
                if events.send(DiscoveryEvent::Sighting(sighting)).await.is_err() {
                    return Ok(());
                }
            }
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}

/// Turn a datagram into a sighting, dropping our own and malformed ones
fn accept_datagram(datagram: &[u8], src: SocketAddr, own_id: &str) -> Option<Sighting> {
    match Announcement::parse(datagram) {
        Ok(announcement) if announcement.node_id == own_id => None,
        Ok(announcement) => {
            tracing::trace!("announcement from {}: {}", src, announcement.node_id);
            Some(Sighting {
                announcement,
                observed_addr: src,
                seen_at: Instant::now(),
            })
        }
        Err(e) => {
            tracing::debug!("ignoring datagram from {}: {}", src, e);
            None
        }
    }
}
