//! Protocol message definitions
//!
//! Messages are grouped by frame type. The frame header carries the type tag,
//! the payload carries the bincode-encoded body for that type.

use serde::{Deserialize, Serialize};

use crate::input::InputEvent;

/// Mouse button identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MouseButton {
    Left = 0,
    Right = 1,
    Middle = 2,
    Button4 = 3,
    Button5 = 4,
}

impl MouseButton {
    pub const ALL: [MouseButton; 5] = [
        MouseButton::Left,
        MouseButton::Right,
        MouseButton::Middle,
        MouseButton::Button4,
        MouseButton::Button5,
    ];
}

/// Keyboard modifier flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
    pub meta: bool, // Command on macOS, Windows key on Windows
}

/// Screen edge identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScreenEdge {
    Left = 0,
    Right = 1,
    Top = 2,
    Bottom = 3,
}

impl ScreenEdge {
    pub const ALL: [ScreenEdge; 4] = [
        ScreenEdge::Left,
        ScreenEdge::Right,
        ScreenEdge::Top,
        ScreenEdge::Bottom,
    ];

    /// The edge on the other side of a shared boundary
    pub fn opposite(self) -> Self {
        match self {
            ScreenEdge::Left => ScreenEdge::Right,
            ScreenEdge::Right => ScreenEdge::Left,
            ScreenEdge::Top => ScreenEdge::Bottom,
            ScreenEdge::Bottom => ScreenEdge::Top,
        }
    }

    pub fn is_vertical(self) -> bool {
        matches!(self, ScreenEdge::Left | ScreenEdge::Right)
    }
}

impl std::fmt::Display for ScreenEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScreenEdge::Left => "left",
            ScreenEdge::Right => "right",
            ScreenEdge::Top => "top",
            ScreenEdge::Bottom => "bottom",
        };
        f.write_str(name)
    }
}

/// Screen information for a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenInfo {
    /// Stable node identifier
    pub node_id: String,
    /// Human-readable name
    pub name: String,
    /// Screen width in pixels
    pub width: u32,
    /// Screen height in pixels
    pub height: u32,
}

impl ScreenInfo {
    pub fn new(node_id: impl Into<String>, name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            node_id: node_id.into(),
            name: name.into(),
            width,
            height,
        }
    }
}

/// Frame type tags as they appear in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Handshake = 0x01,
    Heartbeat = 0x02,
    Control = 0x03,
    Input = 0x04,
}

impl FrameKind {
    /// Map a header tag to a known frame type. Unknown tags yield `None`.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(FrameKind::Handshake),
            0x02 => Some(FrameKind::Heartbeat),
            0x03 => Some(FrameKind::Control),
            0x04 => Some(FrameKind::Input),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Why a handshake was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    BadToken,
    VersionMismatch,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::BadToken => f.write_str("token mismatch"),
            Rejection::VersionMismatch => f.write_str("protocol version mismatch"),
        }
    }
}

/// Link establishment messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Handshake {
    /// Sent by the connecting side
    Hello {
        protocol_version: u32,
        token: String,
        screen: ScreenInfo,
    },
    /// Reply from the accepting side
    Welcome {
        protocol_version: u32,
        screen: ScreenInfo,
        accepted: bool,
        reason: Option<Rejection>,
    },
}

/// Idle keep-alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp_us: u64,
}

/// Ownership transfer messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Controller asks a node to take input. `edge` is the node's edge the
    /// cursor enters through, `x`/`y` the entry point in node coordinates.
    TransferRequest {
        transfer_id: u32,
        edge: ScreenEdge,
        x: i32,
        y: i32,
    },
    /// Node accepted the transfer
    TransferAck { transfer_id: u32 },
    /// Node refused the transfer
    TransferReject { transfer_id: u32, reason: String },
    /// Node's cursor crossed back over the edge facing the controller.
    /// `along` is the coordinate along that edge in node space.
    ReturnRequest { edge: ScreenEdge, along: i32 },
    /// Controller took input back after a return request
    ReturnAck,
    /// Controller took input back on its own (hotkey or shutdown)
    Revoke,
    /// Graceful close
    Disconnect { reason: String },
}

/// All possible protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Handshake(Handshake),
    Heartbeat(Heartbeat),
    Control(ControlMessage),
    Input(InputEvent),
}

impl Message {
    /// Frame type this message is carried in
    pub fn kind(&self) -> FrameKind {
        match self {
            Message::Handshake(_) => FrameKind::Handshake,
            Message::Heartbeat(_) => FrameKind::Heartbeat,
            Message::Control(_) => FrameKind::Control,
            Message::Input(_) => FrameKind::Input,
        }
    }

    pub fn heartbeat() -> Self {
        Message::Heartbeat(Heartbeat {
            timestamp_us: crate::input::now_micros(),
        })
    }

    pub fn disconnect(reason: impl Into<String>) -> Self {
        Message::Control(ControlMessage::Disconnect {
            reason: reason.into(),
        })
    }
}
