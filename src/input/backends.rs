//! Built-in capture/inject backends
//!
//! OS hooks live outside this crate. These backends cover embedding
//! (events fed through a channel), headless nodes, and diagnostics.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::events::InputEvent;
use super::traits::{InputCapture, InputError, InputInjector, InputResult};

/// Backend selection, read from `[input] backend`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Capture nothing, log injected events
    #[default]
    Tracing,
    /// Capture from a channel, log injected events
    Channel,
}

/// Capture fed by an external producer through an mpsc channel
pub struct ChannelCapture {
    source: Option<mpsc::Receiver<InputEvent>>,
    capturing: bool,
    suppress: bool,
    stop_tx: Option<mpsc::Sender<()>>,
}

impl ChannelCapture {
    /// Create a capture and the sender that feeds it
    pub fn new() -> (Self, mpsc::Sender<InputEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        (
            Self {
                source: Some(rx),
                capturing: false,
                suppress: false,
                stop_tx: None,
            },
            tx,
        )
    }
}

#[async_trait]
impl InputCapture for ChannelCapture {
    async fn start(&mut self) -> InputResult<mpsc::Receiver<InputEvent>> {
        let mut source = self.source.take().ok_or(InputError::AlreadyStarted)?;
        let (out_tx, out_rx) = mpsc::channel(1024);
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        self.stop_tx = Some(stop_tx);
        self.capturing = true;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = source.recv() => {
                        let Some(event) = event else { break };
                        if out_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
            tracing::debug!("channel capture stopped");
        });

        Ok(out_rx)
    }

    async fn stop(&mut self) -> InputResult<()> {
        let tx = self.stop_tx.take().ok_or(InputError::NotStarted)?;
        let _ = tx.send(()).await;
        self.capturing = false;
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing
    }

    fn set_suppress(&mut self, suppress: bool) {
        self.suppress = suppress;
    }

    fn is_suppressing(&self) -> bool {
        self.suppress
    }
}

/// Capture that never produces events (nodes, headless controllers)
#[derive(Default)]
pub struct IdleCapture {
    keep_open: Option<mpsc::Sender<InputEvent>>,
    suppress: bool,
}

#[async_trait]
impl InputCapture for IdleCapture {
    async fn start(&mut self) -> InputResult<mpsc::Receiver<InputEvent>> {
        if self.keep_open.is_some() {
            return Err(InputError::AlreadyStarted);
        }
        let (tx, rx) = mpsc::channel(1);
        self.keep_open = Some(tx);
        Ok(rx)
    }

    async fn stop(&mut self) -> InputResult<()> {
        self.keep_open.take().map(|_| ()).ok_or(InputError::NotStarted)
    }

    fn is_capturing(&self) -> bool {
        self.keep_open.is_some()
    }

    fn set_suppress(&mut self, suppress: bool) {
        self.suppress = suppress;
    }

    fn is_suppressing(&self) -> bool {
        self.suppress
    }
}

/// Injector that logs every event instead of synthesizing it
#[derive(Default)]
pub struct TracingInjector {
    injected: u64,
}

impl TracingInjector {
    pub fn injected(&self) -> u64 {
        self.injected
    }
}

#[async_trait]
impl InputInjector for TracingInjector {
    async fn inject(&mut self, event: &InputEvent) -> InputResult<()> {
        self.injected += 1;
        tracing::debug!(?event, "inject");
        Ok(())
    }
}

/// Build the capture/inject pair for a backend
pub fn select_backends(
    backend: Backend,
) -> (
    Box<dyn InputCapture>,
    Box<dyn InputInjector>,
    Option<mpsc::Sender<InputEvent>>,
) {
    match backend {
        Backend::Tracing => (
            Box::new(IdleCapture::default()),
            Box::new(TracingInjector::default()),
            None,
        ),
        Backend::Channel => {
            let (capture, feed) = ChannelCapture::new();
            (Box::new(capture), Box::new(TracingInjector::default()), Some(feed))
        }
    }
}
