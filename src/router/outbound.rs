//! Controller-side routing of captured input

use std::collections::BTreeSet;

use crate::input::{HeldInputs, InputEvent, MouseMoveEvent, MouseScrollEvent};
use crate::registry::NodeId;
use crate::session::Owner;

/// Where a captured event goes
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Real local input; nothing to do
    Local,
    /// Send to the owning node
    Forward {
        node: NodeId,
        sequence: u64,
        event: InputEvent,
    },
    /// The release hotkey completed; the event is consumed
    Hotkey,
}

/// Tuning for forwarded input
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub mouse_sensitivity: f64,
    pub scroll_multiplier: f64,
    /// Keycodes that together take input back to the controller
    pub release_hotkey: Vec<u32>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mouse_sensitivity: 1.0,
            scroll_multiplier: 1.0,
            release_hotkey: Vec::new(),
        }
    }
}

/// Routes captured events by current owner
pub struct OutboundRouter {
    config: RouterConfig,
    sequence: u64,
    /// Keys physically down on the controller, for hotkey detection
    down: BTreeSet<u32>,
    /// What is held on the node we forward to
    target: Option<NodeId>,
    held: HeldInputs,
    /// Sub-pixel motion carried between events
    carry: (f64, f64),
}

impl OutboundRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            sequence: 0,
            down: BTreeSet::new(),
            target: None,
            held: HeldInputs::new(),
            carry: (0.0, 0.0),
        }
    }

    /// Events routed so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn hotkey_completed(&mut self, event: &InputEvent) -> bool {
        let InputEvent::Keyboard(key) = event else {
            return false;
        };
        if key.pressed {
            self.down.insert(key.keycode);
        } else {
            self.down.remove(&key.keycode);
            return false;
        }
        let hotkey = &self.config.release_hotkey;
        !hotkey.is_empty()
            && hotkey.contains(&key.keycode)
            && hotkey.iter().all(|k| self.down.contains(k))
    }

    /// Route one captured event
    pub fn route(&mut self, event: InputEvent, owner: &Owner) -> Route {
        self.sequence += 1;

        if self.hotkey_completed(&event) {
            tracing::info!("release hotkey pressed");
            return Route::Hotkey;
        }

        let node = match owner {
            Owner::Local => return Route::Local,
            Owner::Node(node) => node,
        };

        if self.target.as_deref() != Some(node.as_str()) {
            // New destination; anything held belonged to the previous one
            self.held = HeldInputs::new();
            self.carry = (0.0, 0.0);
            self.target = Some(node.clone());
        }

        let event = self.scale(event);
        self.held.observe(&event);
        tracing::trace!(%node, sequence = self.sequence, "forwarding event");
        Route::Forward {
            node: node.clone(),
            sequence: self.sequence,
            event,
        }
    }

    fn scale(&mut self, event: InputEvent) -> InputEvent {
        match event {
            InputEvent::MouseMove(m) if m.x.is_none() && m.y.is_none() => {
                let sensitivity = self.config.mouse_sensitivity;
                let dx = m.dx as f64 * sensitivity + self.carry.0;
                let dy = m.dy as f64 * sensitivity + self.carry.1;
                self.carry = (dx.fract(), dy.fract());
                InputEvent::MouseMove(MouseMoveEvent {
                    dx: dx.trunc() as i32,
                    dy: dy.trunc() as i32,
                    ..m
                })
            }
            InputEvent::MouseScroll(s) => {
                let multiplier = self.config.scroll_multiplier;
                InputEvent::MouseScroll(MouseScrollEvent {
                    dx: (s.dx as f64 * multiplier).round() as i32,
                    dy: (s.dy as f64 * multiplier).round() as i32,
                    ..s
                })
            }
            other => other,
        }
    }

    /// Ownership left the node we were forwarding to. Returns the node and
    /// the releases for whatever is still held there.
    pub fn release_held(&mut self) -> Option<(NodeId, Vec<InputEvent>)> {
        let node = self.target.take()?;
        self.carry = (0.0, 0.0);
        let releases = self.held.drain_releases();
        if !releases.is_empty() {
            tracing::debug!(%node, count = releases.len(), "releasing held input");
        }
        Some((node, releases))
    }
}
