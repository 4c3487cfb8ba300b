//! Screen edge detection
//!
//! Detects when the cursor reaches the edge of the screen and decides when
//! that counts as a crossing, honouring dwell time and double-tap settings.

use std::time::Instant;

use crate::protocol::ScreenEdge;

/// Configuration for edge detection
#[derive(Debug, Clone)]
pub struct EdgeDetectorConfig {
    /// Distance in pixels from the screen edge that still counts as the edge
    pub edge_margin: u32,
    /// Minimum time cursor must be at edge before transitioning (ms)
    pub dwell_time_ms: u64,
    /// Whether to require double-tap at edge to transition
    pub require_double_tap: bool,
    /// Time window for double-tap detection (ms)
    pub double_tap_window_ms: u64,
    /// Edges that are enabled for transitions
    pub enabled_edges: EdgeMask,
}

impl Default for EdgeDetectorConfig {
    fn default() -> Self {
        Self {
            edge_margin: 0,
            dwell_time_ms: 0, // Instant transition
            require_double_tap: false,
            double_tap_window_ms: 500,
            enabled_edges: EdgeMask::all(),
        }
    }
}

/// Bitmask for enabled edges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeMask(u8);

impl EdgeMask {
    pub const NONE: EdgeMask = EdgeMask(0);

    pub fn all() -> Self {
        Self(0b1111)
    }

    fn bit(edge: ScreenEdge) -> u8 {
        1 << (edge as u8)
    }

    pub fn is_enabled(&self, edge: ScreenEdge) -> bool {
        (self.0 & Self::bit(edge)) != 0
    }

    pub fn enable(&mut self, edge: ScreenEdge) {
        self.0 |= Self::bit(edge);
    }

    pub fn disable(&mut self, edge: ScreenEdge) {
        self.0 &= !Self::bit(edge);
    }
}

impl FromIterator<ScreenEdge> for EdgeMask {
    fn from_iter<I: IntoIterator<Item = ScreenEdge>>(iter: I) -> Self {
        let mut mask = EdgeMask::NONE;
        for edge in iter {
            mask.enable(edge);
        }
        mask
    }
}

/// Result of edge detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeDetectResult {
    /// Cursor is not at any edge
    NotAtEdge,
    /// Cursor is resting on an edge it has already been accounted for
    Resting { edge: ScreenEdge },
    /// Cursor is at edge but waiting for dwell time or a second tap
    Dwelling { edge: ScreenEdge, remaining_ms: u64 },
    /// Cursor crossed the edge
    Transition {
        edge: ScreenEdge,
        /// Pixel coordinate along the edge
        along: i32,
    },
}

/// State for edge detection
#[derive(Default, Clone, Copy)]
struct EdgeState {
    /// When the cursor first touched this edge
    touch_start: Option<Instant>,
    /// Last time cursor touched this edge (for double-tap)
    last_tap: Option<Instant>,
}

/// Detects screen edge transitions
pub struct EdgeDetector {
    config: EdgeDetectorConfig,
    screen_width: u32,
    screen_height: u32,
    edge_states: [EdgeState; 4],
    current_edge: Option<ScreenEdge>,
}

impl EdgeDetector {
    /// Create a new edge detector
    pub fn new(config: EdgeDetectorConfig, screen_width: u32, screen_height: u32) -> Self {
        Self {
            config,
            screen_width,
            screen_height,
            edge_states: Default::default(),
            current_edge: None,
        }
    }

    pub fn set_enabled_edges(&mut self, mask: EdgeMask) {
        self.config.enabled_edges = mask;
    }

    pub fn config(&self) -> &EdgeDetectorConfig {
        &self.config
    }

    fn edge_at(&self, x: i32, y: i32) -> Option<ScreenEdge> {
        let margin = self.config.edge_margin as i32;
        let max_x = self.screen_width.saturating_sub(1) as i32;
        let max_y = self.screen_height.saturating_sub(1) as i32;
        let enabled = self.config.enabled_edges;

        if x <= margin && enabled.is_enabled(ScreenEdge::Left) {
            Some(ScreenEdge::Left)
        } else if x >= max_x - margin && enabled.is_enabled(ScreenEdge::Right) {
            Some(ScreenEdge::Right)
        } else if y <= margin && enabled.is_enabled(ScreenEdge::Top) {
            Some(ScreenEdge::Top)
        } else if y >= max_y - margin && enabled.is_enabled(ScreenEdge::Bottom) {
            Some(ScreenEdge::Bottom)
        } else {
            None
        }
    }

    /// Check a cursor position. `dx`/`dy` is the motion that produced it,
    /// used to tell a push into an edge from resting on it.
    pub fn check(&mut self, x: i32, y: i32, dx: i32, dy: i32) -> EdgeDetectResult {
        let detected_edge = self.edge_at(x, y);

        match (self.current_edge, detected_edge) {
            // No longer at edge
            (Some(prev_edge), None) => {
                let idx = prev_edge as usize;
                if self.config.require_double_tap {
                    self.edge_states[idx].last_tap = self.edge_states[idx].touch_start;
                }
                self.edge_states[idx].touch_start = None;
                self.current_edge = None;
                EdgeDetectResult::NotAtEdge
            }

            // Just reached an edge
            (None, Some(edge)) => self.touch(edge, x, y),

            // Still at the same edge
            (Some(edge), Some(new_edge)) if edge == new_edge => {
                let idx = edge as usize;
                match self.edge_states[idx].touch_start {
                    Some(start) => {
                        let elapsed = start.elapsed().as_millis() as u64;
                        if elapsed >= self.config.dwell_time_ms && !self.config.require_double_tap {
                            EdgeDetectResult::Transition {
                                edge,
                                along: self.along(edge, x, y),
                            }
                        } else if self.config.require_double_tap {
                            EdgeDetectResult::Resting { edge }
                        } else {
                            EdgeDetectResult::Dwelling {
                                edge,
                                remaining_ms: self.config.dwell_time_ms - elapsed,
                            }
                        }
                    }
                    // Settled here without a touch: only a push counts
                    None if pushes_into(edge, dx, dy) => self.touch(edge, x, y),
                    None => EdgeDetectResult::Resting { edge },
                }
            }

            // Moved directly from one edge to another (corner case)
            (Some(_prev_edge), Some(new_edge)) => {
                self.edge_states = Default::default();
                self.current_edge = None;
                self.touch(new_edge, x, y)
            }

            (None, None) => EdgeDetectResult::NotAtEdge,
        }
    }

    fn touch(&mut self, edge: ScreenEdge, x: i32, y: i32) -> EdgeDetectResult {
        let idx = edge as usize;
        let now = Instant::now();
        self.current_edge = Some(edge);

        if self.config.require_double_tap {
            if let Some(last_tap) = self.edge_states[idx].last_tap.take() {
                let elapsed = now.duration_since(last_tap).as_millis() as u64;
                if elapsed <= self.config.double_tap_window_ms {
                    self.edge_states[idx].touch_start = None;
                    return EdgeDetectResult::Transition {
                        edge,
                        along: self.along(edge, x, y),
                    };
                }
            }
            self.edge_states[idx].touch_start = Some(now);
            return EdgeDetectResult::Dwelling {
                edge,
                remaining_ms: self.config.double_tap_window_ms,
            };
        }

        self.edge_states[idx].touch_start = Some(now);
        if self.config.dwell_time_ms == 0 {
            EdgeDetectResult::Transition {
                edge,
                along: self.along(edge, x, y),
            }
        } else {
            EdgeDetectResult::Dwelling {
                edge,
                remaining_ms: self.config.dwell_time_ms,
            }
        }
    }

    fn along(&self, edge: ScreenEdge, x: i32, y: i32) -> i32 {
        if edge.is_vertical() {
            y.clamp(0, self.screen_height.saturating_sub(1) as i32)
        } else {
            x.clamp(0, self.screen_width.saturating_sub(1) as i32)
        }
    }

    /// Treat the cursor as resting on `edge` without having touched it, so
    /// that staying there does not count as a crossing. Used after the
    /// cursor is placed on an edge by a handoff.
    pub fn settle_at(&mut self, edge: ScreenEdge) {
        self.edge_states = Default::default();
        self.current_edge = Some(edge);
    }

    /// Reset all edge states
    pub fn reset(&mut self) {
        self.edge_states = Default::default();
        self.current_edge = None;
    }

    /// Get the current edge (if cursor is at one)
    pub fn current_edge(&self) -> Option<ScreenEdge> {
        self.current_edge
    }
}

fn pushes_into(edge: ScreenEdge, dx: i32, dy: i32) -> bool {
    match edge {
        ScreenEdge::Left => dx < 0,
        ScreenEdge::Right => dx > 0,
        ScreenEdge::Top => dy < 0,
        ScreenEdge::Bottom => dy > 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_edge_detection_left() {
        let mut detector = EdgeDetector::new(EdgeDetectorConfig::default(), 1920, 1080);
        let result = detector.check(0, 500, -3, 0);
        assert_eq!(
            result,
            EdgeDetectResult::Transition {
                edge: ScreenEdge::Left,
                along: 500
            }
        );
    }

    #[test]
    fn test_edge_detection_right() {
        let mut detector = EdgeDetector::new(EdgeDetectorConfig::default(), 1920, 1080);
        assert_eq!(detector.check(1918, 500, 1, 0), EdgeDetectResult::NotAtEdge);
        assert!(matches!(
            detector.check(1919, 500, 1, 0),
            EdgeDetectResult::Transition { edge: ScreenEdge::Right, .. }
        ));
    }

    #[test]
    fn test_edge_detection_with_dwell() {
        let config = EdgeDetectorConfig {
            dwell_time_ms: 100,
            ..Default::default()
        };
        let mut detector = EdgeDetector::new(config, 1920, 1080);

        let result = detector.check(0, 500, -1, 0);
        assert!(matches!(result, EdgeDetectResult::Dwelling { .. }));

        std::thread::sleep(Duration::from_millis(150));
        let result = detector.check(0, 500, -1, 0);
        assert!(matches!(result, EdgeDetectResult::Transition { .. }));
    }

    #[test]
    fn test_double_tap() {
        let config = EdgeDetectorConfig {
            require_double_tap: true,
            ..Default::default()
        };
        let mut detector = EdgeDetector::new(config, 1920, 1080);

        assert!(matches!(
            detector.check(1919, 10, 1, 0),
            EdgeDetectResult::Dwelling { .. }
        ));
        assert_eq!(detector.check(1900, 10, -19, 0), EdgeDetectResult::NotAtEdge);
        assert!(matches!(
            detector.check(1919, 10, 19, 0),
            EdgeDetectResult::Transition { edge: ScreenEdge::Right, .. }
        ));
    }

    #[test]
    fn test_disabled_edge() {
        let mut config = EdgeDetectorConfig::default();
        config.enabled_edges.disable(ScreenEdge::Left);
        let mut detector = EdgeDetector::new(config, 1920, 1080);

        assert_eq!(detector.check(0, 500, -1, 0), EdgeDetectResult::NotAtEdge);
        assert!(matches!(
            detector.check(1919, 500, 1, 0),
            EdgeDetectResult::Transition { .. }
        ));
    }

    #[test]
    fn test_settled_edge_needs_push() {
        let mut detector = EdgeDetector::new(EdgeDetectorConfig::default(), 1920, 1080);
        detector.settle_at(ScreenEdge::Left);

        // Sliding along the edge does not cross it
        assert_eq!(
            detector.check(0, 300, 0, 5),
            EdgeDetectResult::Resting { edge: ScreenEdge::Left }
        );
        // Pushing into it does
        assert_eq!(
            detector.check(0, 300, -2, 0),
            EdgeDetectResult::Transition {
                edge: ScreenEdge::Left,
                along: 300
            }
        );
    }

    #[test]
    fn test_mask_from_edges() {
        let mask: EdgeMask = [ScreenEdge::Right, ScreenEdge::Top].into_iter().collect();
        assert!(mask.is_enabled(ScreenEdge::Right));
        assert!(mask.is_enabled(ScreenEdge::Top));
        assert!(!mask.is_enabled(ScreenEdge::Left));
        assert!(!mask.is_enabled(ScreenEdge::Bottom));
    }
}
