//! Network module - TCP links between controller and nodes
//!
//! Provides:
//! - `Connection`: a raw framed stream and the token handshake
//! - `Link`: an established link with independent reader/writer tasks,
//!   idle heartbeats and timeout-based loss detection
//! - `Listener`: accepts inbound links

mod connection;
mod link;
mod server;

pub use connection::*;
pub use link::*;
pub use server::*;

use std::time::Duration;

/// Timing configuration for links
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Time allowed for the hello/welcome exchange
    pub handshake_timeout: Duration,
    /// Send a heartbeat after this long without other outbound traffic
    pub heartbeat_interval: Duration,
    /// Close the link after this long without any inbound traffic
    pub link_timeout: Duration,
    /// Outbound queue depth per link
    pub send_queue: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            handshake_timeout: Duration::from_millis(3000),
            heartbeat_interval: Duration::from_millis(1000),
            link_timeout: Duration::from_millis(3500),
            send_queue: 1024,
        }
    }
}
