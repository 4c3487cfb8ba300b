//! Input trait definitions
//!
//! Defines the capability pair every capture/inject backend provides.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::events::InputEvent;

/// Errors that can occur during input operations
#[derive(Error, Debug)]
pub enum InputError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Not supported on this platform")]
    NotSupported,

    #[error("Input capture already started")]
    AlreadyStarted,

    #[error("Input capture not started")]
    NotStarted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type InputResult<T> = Result<T, InputError>;

/// Trait for capturing input events from the local system
#[async_trait]
pub trait InputCapture: Send + Sync {
    /// Start capturing input events.
    /// Returns a receiver that will emit captured events until `stop`.
    async fn start(&mut self) -> InputResult<mpsc::Receiver<InputEvent>>;

    /// Stop capturing input events
    async fn stop(&mut self) -> InputResult<()>;

    /// Check if capture is currently active
    fn is_capturing(&self) -> bool;

    /// Set whether captured events should be suppressed (not passed to the
    /// local system). Set while a remote node owns input.
    fn set_suppress(&mut self, suppress: bool);

    /// Check if events are being suppressed
    fn is_suppressing(&self) -> bool;
}

/// Trait for injecting input events into the local system
#[async_trait]
pub trait InputInjector: Send + Sync {
    /// Synthesize one event on the local machine
    async fn inject(&mut self, event: &InputEvent) -> InputResult<()>;

    /// Place the local cursor at an absolute position
    async fn warp(&mut self, x: i32, y: i32) -> InputResult<()> {
        self.inject(&InputEvent::mouse_to(x, y)).await
    }
}
