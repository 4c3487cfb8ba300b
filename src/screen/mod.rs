//! Screen management module
//!
//! Handles:
//! - Screen edge detection for cursor transitions
//! - The virtual coordinate space and handoff coordinate remapping

mod edge_detector;
mod layout;

pub use edge_detector::{EdgeDetectResult, EdgeDetector, EdgeDetectorConfig, EdgeMask};
pub use layout::{entry_point, return_point, scale_along, ScreenRect};

/// Fallback screen dimensions when the configuration gives none
#[cfg(target_os = "macos")]
pub fn default_screen_dimensions() -> (u32, u32) {
    (2560, 1600)
}

#[cfg(not(target_os = "macos"))]
pub fn default_screen_dimensions() -> (u32, u32) {
    (1920, 1080)
}
