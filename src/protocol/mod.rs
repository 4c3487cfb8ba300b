//! Protocol module - Defines the wire protocol for edgeshare links
//!
//! Every frame on a link has a fixed header followed by a bincode payload:
//! - 4 bytes magic
//! - 1 byte frame type tag (handshake, heartbeat, control, input-event)
//! - 4 bytes payload length (big-endian)
//! - 4 bytes sequence number (big-endian)
//! - Variable length payload

mod codec;
mod message;

pub use codec::*;
pub use message::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Default TCP port for links
pub const DEFAULT_LINK_PORT: u16 = 24800;

/// Default UDP port for discovery announcements
pub const DEFAULT_DISCOVERY_PORT: u16 = 24801;

/// Magic bytes for protocol identification
pub const MAGIC_BYTES: [u8; 4] = [0x45, 0x44, 0x47, 0x53]; // "EDGS"
