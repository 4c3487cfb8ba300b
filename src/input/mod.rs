//! Input module - capture and injection capabilities
//!
//! This module provides:
//! - Platform-independent input events
//! - The `InputCapture` / `InputInjector` capability traits
//! - Built-in backends selected at startup

mod backends;
mod events;
mod traits;

pub use backends::*;
pub use events::*;
pub use traits::*;

/// Get the current platform name
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "macos")]
    return "macOS";

    #[cfg(target_os = "linux")]
    return "Linux";

    #[cfg(target_os = "windows")]
    return "Windows";

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    return "Unknown";
}
