//! Input event types
//!
//! Platform-independent representation of input events.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::{Modifiers, MouseButton};

/// Timestamp for events (microseconds since epoch)
pub type EventTimestamp = u64;

/// Current wall-clock time in microseconds
pub fn now_micros() -> EventTimestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// A mouse movement event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseMoveEvent {
    /// Timestamp of the event
    pub timestamp: EventTimestamp,
    /// Absolute X position (if available)
    pub x: Option<i32>,
    /// Absolute Y position (if available)
    pub y: Option<i32>,
    /// Relative X movement
    pub dx: i32,
    /// Relative Y movement
    pub dy: i32,
}

/// A mouse button event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseButtonEvent {
    pub timestamp: EventTimestamp,
    pub button: MouseButton,
    pub pressed: bool,
}

/// A mouse scroll event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseScrollEvent {
    pub timestamp: EventTimestamp,
    /// Horizontal scroll delta
    pub dx: i32,
    /// Vertical scroll delta
    pub dy: i32,
}

/// A keyboard event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardEvent {
    pub timestamp: EventTimestamp,
    /// Platform-independent keycode (USB HID)
    pub keycode: u32,
    /// Whether the key is pressed (true) or released (false)
    pub pressed: bool,
    /// Current modifier state
    pub modifiers: Modifiers,
}

/// Union of all input event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputEvent {
    MouseMove(MouseMoveEvent),
    MouseButton(MouseButtonEvent),
    MouseScroll(MouseScrollEvent),
    Keyboard(KeyboardEvent),
}

impl InputEvent {
    /// Relative pointer motion
    pub fn mouse_delta(dx: i32, dy: i32) -> Self {
        InputEvent::MouseMove(MouseMoveEvent {
            timestamp: now_micros(),
            x: None,
            y: None,
            dx,
            dy,
        })
    }

    /// Absolute pointer position
    pub fn mouse_to(x: i32, y: i32) -> Self {
        InputEvent::MouseMove(MouseMoveEvent {
            timestamp: now_micros(),
            x: Some(x),
            y: Some(y),
            dx: 0,
            dy: 0,
        })
    }

    pub fn button(button: MouseButton, pressed: bool) -> Self {
        InputEvent::MouseButton(MouseButtonEvent {
            timestamp: now_micros(),
            button,
            pressed,
        })
    }

    pub fn scroll(dx: i32, dy: i32) -> Self {
        InputEvent::MouseScroll(MouseScrollEvent {
            timestamp: now_micros(),
            dx,
            dy,
        })
    }

    pub fn key(keycode: u32, pressed: bool) -> Self {
        InputEvent::Keyboard(KeyboardEvent {
            timestamp: now_micros(),
            keycode,
            pressed,
            modifiers: Modifiers::default(),
        })
    }

    /// Get the timestamp of the event
    pub fn timestamp(&self) -> EventTimestamp {
        match self {
            InputEvent::MouseMove(e) => e.timestamp,
            InputEvent::MouseButton(e) => e.timestamp,
            InputEvent::MouseScroll(e) => e.timestamp,
            InputEvent::Keyboard(e) => e.timestamp,
        }
    }

    /// Check if this is a keyboard event
    pub fn is_keyboard(&self) -> bool {
        matches!(self, InputEvent::Keyboard(_))
    }
}

/// Tracks a cursor inside a screen of known size.
///
/// Absolute positions replace the current point; relative motion is added.
/// The result is always clamped to the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorTracker {
    pub x: i32,
    pub y: i32,
    width: u32,
    height: u32,
}

impl CursorTracker {
    /// Start at the centre of the screen
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x: (width / 2) as i32,
            y: (height / 2) as i32,
            width,
            height,
        }
    }

    pub fn set(&mut self, x: i32, y: i32) {
        self.x = x.clamp(0, self.max_x());
        self.y = y.clamp(0, self.max_y());
    }

    /// Apply a move event and return the new position
    pub fn apply(&mut self, event: &MouseMoveEvent) -> (i32, i32) {
        match (event.x, event.y) {
            (Some(x), Some(y)) => self.set(x, y),
            _ => self.set(
                self.x.saturating_add(event.dx),
                self.y.saturating_add(event.dy),
            ),
        }
        (self.x, self.y)
    }

    pub fn max_x(&self) -> i32 {
        self.width.saturating_sub(1) as i32
    }

    pub fn max_y(&self) -> i32 {
        self.height.saturating_sub(1) as i32
    }
}

/// Keys and buttons currently held down on one destination
#[derive(Debug, Clone, Default)]
pub struct HeldInputs {
    keys: std::collections::BTreeSet<u32>,
    buttons: std::collections::BTreeSet<u8>,
}

impl HeldInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the effect of an event
    pub fn observe(&mut self, event: &InputEvent) {
        match event {
            InputEvent::Keyboard(e) if e.pressed => {
                self.keys.insert(e.keycode);
            }
            InputEvent::Keyboard(e) => {
                self.keys.remove(&e.keycode);
            }
            InputEvent::MouseButton(e) if e.pressed => {
                self.buttons.insert(e.button as u8);
            }
            InputEvent::MouseButton(e) => {
                self.buttons.remove(&(e.button as u8));
            }
            _ => {}
        }
    }

    pub fn is_key_pressed(&self, keycode: u32) -> bool {
        self.keys.contains(&keycode)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.buttons.is_empty()
    }

    /// Release events for everything still held, clearing the set
    pub fn drain_releases(&mut self) -> Vec<InputEvent> {
        let mut releases: Vec<InputEvent> = std::mem::take(&mut self.keys)
            .into_iter()
            .map(|keycode| InputEvent::key(keycode, false))
            .collect();
        let buttons = std::mem::take(&mut self.buttons);
        releases.extend(
            MouseButton::ALL
                .into_iter()
                .filter(|b| buttons.contains(&(*b as u8)))
                .map(|b| InputEvent::button(b, false)),
        );
        releases
    }
}

/// USB HID Keyboard keycodes (subset used for hotkeys and tests)
pub mod keycodes {
    pub const KEY_A: u32 = 0x04;
    pub const KEY_B: u32 = 0x05;
    pub const KEY_C: u32 = 0x06;

    pub const KEY_ENTER: u32 = 0x28;
    pub const KEY_ESCAPE: u32 = 0x29;
    pub const KEY_SPACE: u32 = 0x2C;

    pub const KEY_SCROLL_LOCK: u32 = 0x47;

    pub const KEY_LEFT_CTRL: u32 = 0xE0;
    pub const KEY_LEFT_SHIFT: u32 = 0xE1;
    pub const KEY_LEFT_ALT: u32 = 0xE2;
    pub const KEY_LEFT_META: u32 = 0xE3;
    pub const KEY_RIGHT_CTRL: u32 = 0xE4;
    pub const KEY_RIGHT_SHIFT: u32 = 0xE5;
    pub const KEY_RIGHT_ALT: u32 = 0xE6;
    pub const KEY_RIGHT_META: u32 = 0xE7;
}
