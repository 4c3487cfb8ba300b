//! Configuration module
//!
//! Handles loading, validating and saving edgeshare configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::discovery::DiscoveryConfig;
use crate::input::Backend;
use crate::network::LinkConfig;
use crate::protocol::{ScreenInfo, DEFAULT_DISCOVERY_PORT, DEFAULT_LINK_PORT};
use crate::registry::{LayoutPosition, NodeCandidate, NodeRegistry, RegistryError};
use crate::router::RouterConfig;
use crate::screen::{default_screen_dimensions, EdgeDetectorConfig, EdgeMask, ScreenRect};
use crate::session::SessionConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid layout: {0}")]
    Layout(#[from] RegistryError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub screen: ScreenConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub input: InputConfig,

    /// Statically configured nodes and their layout positions
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Unique node identifier (generated if not set)
    pub node_id: Option<String>,
    /// Human-readable name for this machine
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            verbose: false,
        }
    }
}

/// Screen configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenConfig {
    /// Screen width override
    pub width: Option<u32>,
    /// Screen height override
    pub height: Option<u32>,
    /// Edge detection margin in pixels
    #[serde(default)]
    pub edge_margin: u32,
    /// Dwell time before transition (ms)
    #[serde(default)]
    pub dwell_time_ms: u64,
    /// Require double-tap at edge to transition
    #[serde(default)]
    pub require_double_tap: bool,
    #[serde(default = "default_double_tap_window")]
    pub double_tap_window_ms: u64,
}

fn default_double_tap_window() -> u64 {
    500
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            edge_margin: 0,
            dwell_time_ms: 0,
            require_double_tap: false,
            double_tap_window_ms: default_double_tap_window(),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP port for links
    #[serde(default = "default_link_port")]
    pub link_port: u16,
    /// UDP port for discovery announcements
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Broadcast destination; empty disables broadcast
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
    /// Unicast announcement targets, `ip` or `ip:port`
    #[serde(default)]
    pub static_targets: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Close a link after this long without traffic
    #[serde(default = "default_link_timeout")]
    pub link_timeout_ms: u64,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_ms: u64,
    #[serde(default = "default_announce_interval")]
    pub announce_interval_ms: u64,
    /// Mark a silent discovered node lost after this long
    #[serde(default = "default_node_lost_after")]
    pub node_lost_after_ms: u64,
    /// Forget a silent discovered node after this long
    #[serde(default = "default_node_forget_after")]
    pub node_forget_after_ms: u64,
    #[serde(default = "default_true")]
    pub enable_discovery: bool,
}

fn default_link_port() -> u16 {
    DEFAULT_LINK_PORT
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_handshake_timeout() -> u64 {
    3000
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_link_timeout() -> u64 {
    3500
}

fn default_reconnect_interval() -> u64 {
    2000
}

fn default_transfer_timeout() -> u64 {
    1000
}

fn default_announce_interval() -> u64 {
    1000
}

fn default_node_lost_after() -> u64 {
    5000
}

fn default_node_forget_after() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            link_port: default_link_port(),
            discovery_port: default_discovery_port(),
            bind_address: None,
            broadcast_address: default_broadcast_address(),
            static_targets: Vec::new(),
            connect_timeout_ms: default_connect_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            link_timeout_ms: default_link_timeout(),
            reconnect_interval_ms: default_reconnect_interval(),
            transfer_timeout_ms: default_transfer_timeout(),
            announce_interval_ms: default_announce_interval(),
            node_lost_after_ms: default_node_lost_after(),
            node_forget_after_ms: default_node_forget_after(),
            enable_discovery: default_true(),
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Shared secret presented in the link handshake
    #[serde(default)]
    pub token: String,
}

/// Input configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default)]
    pub backend: Backend,
    /// Multiplier for forwarded relative mouse motion
    #[serde(default = "default_multiplier")]
    pub mouse_sensitivity: f64,
    #[serde(default = "default_multiplier")]
    pub scroll_multiplier: f64,
    /// HID keycodes that together take input back to the controller
    #[serde(default = "default_release_hotkey")]
    pub release_hotkey: Vec<u32>,
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_release_hotkey() -> Vec<u32> {
    use crate::input::keycodes::{KEY_LEFT_CTRL, KEY_SCROLL_LOCK};
    vec![KEY_LEFT_CTRL, KEY_SCROLL_LOCK]
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            mouse_sensitivity: default_multiplier(),
            scroll_multiplier: default_multiplier(),
            release_hotkey: default_release_hotkey(),
        }
    }
}

/// A statically configured node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub name: Option<String>,
    /// `ip` or `ip:port`; the link port is used when no port is given
    pub address: String,
    #[serde(default)]
    pub position: LayoutPosition,
}

fn parse_addr(value: &str, default_port: u16) -> ConfigResult<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| ConfigError::Invalid(format!("not an address: {:?}", value)))
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("edgeshare/config.toml")),
            Some(PathBuf::from("./edgeshare.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading config from {}", path.display());
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// The node id, generating and keeping one if not set
    pub fn ensure_node_id(&mut self) -> &str {
        self.general
            .node_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn screen_rect(&self) -> ScreenRect {
        let (default_w, default_h) = default_screen_dimensions();
        ScreenRect::new(
            self.screen.width.unwrap_or(default_w),
            self.screen.height.unwrap_or(default_h),
        )
    }

    /// Local screen description for handshakes and announcements
    pub fn local_screen(&mut self) -> ScreenInfo {
        let rect = self.screen_rect();
        let id = self.ensure_node_id().to_string();
        ScreenInfo::new(id, self.general.name.clone(), rect.width, rect.height)
    }

    fn bind_ip(&self) -> ConfigResult<IpAddr> {
        match self.network.bind_address.as_deref() {
            None | Some("") => Ok(IpAddr::from([0, 0, 0, 0])),
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("bad bind_address {:?}", value))),
        }
    }

    pub fn link_bind_addr(&self) -> ConfigResult<SocketAddr> {
        Ok(SocketAddr::new(self.bind_ip()?, self.network.link_port))
    }

    pub fn link_config(&self) -> LinkConfig {
        let n = &self.network;
        LinkConfig {
            connect_timeout: Duration::from_millis(n.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(n.handshake_timeout_ms),
            heartbeat_interval: Duration::from_millis(n.heartbeat_interval_ms),
            link_timeout: Duration::from_millis(n.link_timeout_ms),
            ..LinkConfig::default()
        }
    }

    pub fn discovery_config(&self) -> ConfigResult<DiscoveryConfig> {
        let n = &self.network;
        let broadcast_address = match n.broadcast_address.trim() {
            "" => None,
            value => Some(value.parse().map_err(|_| {
                ConfigError::Invalid(format!("bad broadcast_address {:?}", value))
            })?),
        };
        let static_targets = n
            .static_targets
            .iter()
            .map(|t| parse_addr(t, n.discovery_port))
            .collect::<ConfigResult<Vec<_>>>()?;

        Ok(DiscoveryConfig {
            bind_address: self.bind_ip()?,
            port: n.discovery_port,
            broadcast_address,
            static_targets,
            announce_interval: Duration::from_millis(n.announce_interval_ms),
            retry_interval: Duration::from_millis(n.reconnect_interval_ms),
        })
    }

    pub fn edge_config(&self) -> EdgeDetectorConfig {
        EdgeDetectorConfig {
            edge_margin: self.screen.edge_margin,
            dwell_time_ms: self.screen.dwell_time_ms,
            require_double_tap: self.screen.require_double_tap,
            double_tap_window_ms: self.screen.double_tap_window_ms,
            enabled_edges: EdgeMask::all(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            transfer_timeout: Duration::from_millis(self.network.transfer_timeout_ms),
            edges: self.edge_config(),
            ..SessionConfig::new(self.screen_rect())
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            mouse_sensitivity: self.input.mouse_sensitivity,
            scroll_multiplier: self.input.scroll_multiplier,
            release_hotkey: self.input.release_hotkey.clone(),
        }
    }

    /// Registry seeded with the configured peers. Fails on a layout
    /// conflict: the first peer listed for a position keeps it.
    pub fn peer_registry(&self, now: Instant) -> ConfigResult<NodeRegistry> {
        let mut registry = NodeRegistry::new();
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate peer id {:?}", peer.id)));
            }
            let candidate = NodeCandidate {
                id: peer.id.clone(),
                name: peer.name.clone().unwrap_or_else(|| peer.id.clone()),
                addr: parse_addr(&peer.address, self.network.link_port)?,
                screen: None,
            };
            registry.add_manual(candidate, peer.position, now)?;
        }
        Ok(registry)
    }

    /// Check everything that would otherwise fail later at runtime
    pub fn validate(&self) -> ConfigResult<()> {
        let n = &self.network;
        if self.security.token.trim().is_empty() {
            return Err(ConfigError::Invalid("security.token must be set".to_string()));
        }
        if n.link_port == 0 || n.discovery_port == 0 {
            return Err(ConfigError::Invalid("ports must be non-zero".to_string()));
        }
        if n.link_port == n.discovery_port {
            return Err(ConfigError::Invalid(
                "link_port and discovery_port must differ".to_string(),
            ));
        }
        if n.heartbeat_interval_ms == 0 || n.heartbeat_interval_ms >= n.link_timeout_ms {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be non-zero and below link_timeout_ms".to_string(),
            ));
        }
        if n.node_lost_after_ms > n.node_forget_after_ms {
            return Err(ConfigError::Invalid(
                "node_lost_after_ms must not exceed node_forget_after_ms".to_string(),
            ));
        }
        if !(self.input.mouse_sensitivity > 0.0) || !(self.input.scroll_multiplier > 0.0) {
            return Err(ConfigError::Invalid(
                "mouse_sensitivity and scroll_multiplier must be positive".to_string(),
            ));
        }
        self.bind_ip()?;
        self.discovery_config()?;
        self.peer_registry(Instant::now())?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            node_id: Some("office-desktop".to_string()),
            name: "Office Desktop".to_string(),
            verbose: false,
        },
        screen: ScreenConfig {
            width: Some(1920),
            height: Some(1080),
            ..ScreenConfig::default()
        },
        security: SecurityConfig {
            token: "change-me".to_string(),
        },
        peers: vec![PeerConfig {
            id: "laptop".to_string(),
            name: Some("Laptop".to_string()),
            address: "192.168.1.20".to_string(),
            position: LayoutPosition::Right,
        }],
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid() -> Config {
        let mut config = Config::default();
        config.security.token = "secret".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.link_port, DEFAULT_LINK_PORT);
        assert_eq!(config.network.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert!(config.network.enable_discovery);
        // No token yet
        assert!(config.validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = valid();
        config.ensure_node_id();
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.link_port, config.network.link_port);
        assert_eq!(loaded.general.node_id, config.general.node_id);
        assert_eq!(loaded.security.token, "secret");
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[security]
token = "abc"

[network]
link_port = 4000
static_targets = ["10.0.0.5"]

[[peers]]
id = "left-box"
address = "10.0.0.7:4000"
position = "left"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.network.link_port, 4000);
        assert_eq!(config.network.heartbeat_interval_ms, 1000);
        assert_eq!(config.peers[0].position, LayoutPosition::Left);
        config.validate().unwrap();

        let discovery = config.discovery_config().unwrap();
        assert_eq!(
            discovery.static_targets,
            vec!["10.0.0.5:24801".parse::<SocketAddr>().unwrap()]
        );

        let registry = config.peer_registry(Instant::now()).unwrap();
        let node = registry.get("left-box").unwrap();
        assert_eq!(node.addr, "10.0.0.7:4000".parse::<SocketAddr>().unwrap());
        assert!(node.manual);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/edgeshare.toml")),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_layout_conflict_rejected() {
        let mut config = valid();
        for id in ["a", "b"] {
            config.peers.push(PeerConfig {
                id: id.to_string(),
                name: None,
                address: "10.0.0.9".to_string(),
                position: LayoutPosition::Right,
            });
        }
        match config.validate() {
            Err(ConfigError::Layout(RegistryError::LayoutConflict { holder, .. })) => {
                assert_eq!(holder, "a")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = valid();
        config.network.discovery_port = config.network.link_port;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = valid();
        config.network.heartbeat_interval_ms = config.network.link_timeout_ms;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.peers.push(PeerConfig {
            id: "x".to_string(),
            name: None,
            address: "not an address".to_string(),
            position: LayoutPosition::None,
        });
        assert!(config.validate().is_err());

        let mut config = valid();
        config.network.broadcast_address = String::new();
        assert_eq!(config.discovery_config().unwrap().broadcast_address, None);
    }

    #[test]
    fn test_node_id_is_stable_once_generated() {
        let mut config = Config::default();
        let first = config.ensure_node_id().to_string();
        assert_eq!(config.ensure_node_id(), first);
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "Office Desktop");
        assert_eq!(parsed.peers.len(), 1);
        parsed.validate().unwrap();
    }
}
