//! Node-side application of forwarded input

use crate::input::{HeldInputs, InputEvent, InputInjector};
use crate::protocol::{ControlMessage, Frame, Message};

/// Counters for one inbound router
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InboundStats {
    pub applied: u64,
    pub failures: u64,
    pub gaps: u64,
    /// Input that arrived while this side did not own input
    pub dropped: u64,
}

/// Applies input frames in arrival order
pub struct InboundRouter {
    injector: Box<dyn InputInjector>,
    last_sequence: Option<u32>,
    held: HeldInputs,
    stats: InboundStats,
}

impl InboundRouter {
    pub fn new(injector: Box<dyn InputInjector>) -> Self {
        Self {
            injector,
            last_sequence: None,
            held: HeldInputs::new(),
            stats: InboundStats::default(),
        }
    }

    pub fn stats(&self) -> InboundStats {
        self.stats
    }

    /// Forget sequence state for a new link
    pub fn reset_link(&mut self) {
        self.last_sequence = None;
    }

    fn check_sequence(&mut self, sequence: u32) {
        if let Some(last) = self.last_sequence {
            let expected = last.wrapping_add(1);
            if sequence != expected {
                self.stats.gaps += 1;
                tracing::warn!(expected, got = sequence, "frame sequence gap");
            }
        }
        self.last_sequence = Some(sequence);
    }

    async fn apply(&mut self, event: &InputEvent) {
        match self.injector.inject(event).await {
            Ok(()) => {
                self.held.observe(event);
                self.stats.applied += 1;
            }
            Err(e) => {
                self.stats.failures += 1;
                tracing::warn!(error = %e, failures = self.stats.failures, "injection failed");
            }
        }
    }

    /// Handle one frame. Input is injected when `accept_input` is set;
    /// control messages are returned for the session.
    pub async fn handle(&mut self, frame: Frame, accept_input: bool) -> Option<ControlMessage> {
        self.check_sequence(frame.sequence);
        match frame.message {
            Message::Input(event) if accept_input => {
                self.apply(&event).await;
                None
            }
            Message::Input(_) => {
                self.stats.dropped += 1;
                tracing::debug!("dropping input received while not controlled");
                None
            }
            Message::Control(control) => Some(control),
            other => {
                tracing::debug!(kind = ?other.kind(), "ignoring frame on established link");
                None
            }
        }
    }

    /// Move the local cursor, counting a failure like any other injection
    pub async fn warp(&mut self, x: i32, y: i32) {
        if let Err(e) = self.injector.warp(x, y).await {
            self.stats.failures += 1;
            tracing::warn!(error = %e, "cursor warp failed");
        }
    }

    /// Release every key and button this router pressed
    pub async fn release_all(&mut self) {
        let releases = self.held.drain_releases();
        if !releases.is_empty() {
            tracing::info!(count = releases.len(), "releasing held input");
        }
        for event in releases {
            if let Err(e) = self.injector.inject(&event).await {
                self.stats.failures += 1;
                tracing::warn!(error = %e, "release injection failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{keycodes, InputError, InputResult};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recording {
        events: Arc<Mutex<Vec<InputEvent>>>,
        fail_keys: bool,
    }

    #[async_trait]
    impl InputInjector for Recording {
        async fn inject(&mut self, event: &InputEvent) -> InputResult<()> {
            if self.fail_keys && event.is_keyboard() {
                return Err(InputError::PermissionDenied("no accessibility access".to_string()));
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn frame(sequence: u32, message: Message) -> Frame {
        Frame::new(sequence, message)
    }

    #[tokio::test]
    async fn test_applies_in_receive_order() {
        let recording = Recording::default();
        let mut router = InboundRouter::new(Box::new(recording.clone()));

        for i in 1..=20u32 {
            let result = router
                .handle(frame(i, Message::Input(InputEvent::mouse_delta(i as i32, 0))), true)
                .await;
            assert!(result.is_none());
        }

        let events = recording.events.lock().unwrap();
        let dxs: Vec<i32> = events
            .iter()
            .map(|e| match e {
                InputEvent::MouseMove(m) => m.dx,
                _ => 0,
            })
            .collect();
        assert_eq!(dxs, (1..=20).collect::<Vec<_>>());
        assert_eq!(router.stats().applied, 20);
        assert_eq!(router.stats().gaps, 0);
    }

    #[tokio::test]
    async fn test_control_messages_are_returned() {
        let mut router = InboundRouter::new(Box::new(Recording::default()));
        let control = router
            .handle(frame(1, Message::Control(ControlMessage::Revoke)), true)
            .await;
        assert_eq!(control, Some(ControlMessage::Revoke));
    }

    #[tokio::test]
    async fn test_input_dropped_when_not_accepted() {
        let recording = Recording::default();
        let mut router = InboundRouter::new(Box::new(recording.clone()));
        router
            .handle(frame(1, Message::Input(InputEvent::key(keycodes::KEY_A, true))), false)
            .await;
        assert!(recording.events.lock().unwrap().is_empty());
        assert_eq!(router.stats().dropped, 1);
        assert_eq!(router.stats().gaps, 0);
    }

    #[tokio::test]
    async fn test_gaps_are_counted_not_reordered() {
        let recording = Recording::default();
        let mut router = InboundRouter::new(Box::new(recording.clone()));
        router.handle(frame(1, Message::Input(InputEvent::mouse_delta(1, 0))), true).await;
        router.handle(frame(5, Message::Input(InputEvent::mouse_delta(5, 0))), true).await;
        assert_eq!(router.stats().gaps, 1);
        assert_eq!(recording.events.lock().unwrap().len(), 2);

        router.reset_link();
        router.handle(frame(1, Message::Input(InputEvent::mouse_delta(1, 0))), true).await;
        assert_eq!(router.stats().gaps, 1);
    }

    #[tokio::test]
    async fn test_injection_failure_is_counted() {
        let recording = Recording {
            fail_keys: true,
            ..Recording::default()
        };
        let mut router = InboundRouter::new(Box::new(recording.clone()));
        router.handle(frame(1, Message::Input(InputEvent::key(keycodes::KEY_A, true))), true).await;
        router.handle(frame(2, Message::Input(InputEvent::mouse_delta(1, 1))), true).await;

        assert_eq!(router.stats().failures, 1);
        assert_eq!(router.stats().applied, 1);
    }

    #[tokio::test]
    async fn test_release_all_after_loss() {
        let recording = Recording::default();
        let mut router = InboundRouter::new(Box::new(recording.clone()));
        router.handle(frame(1, Message::Input(InputEvent::key(keycodes::KEY_LEFT_SHIFT, true))), true).await;
        router.handle(frame(2, Message::Input(InputEvent::key(keycodes::KEY_A, true))), true).await;
        router.handle(frame(3, Message::Input(InputEvent::key(keycodes::KEY_A, false))), true).await;

        router.release_all().await;
        let events = recording.events.lock().unwrap();
        let last = events.last().unwrap();
        assert!(matches!(
            last,
            InputEvent::Keyboard(k) if k.keycode == keycodes::KEY_LEFT_SHIFT && !k.pressed
        ));
        assert_eq!(events.len(), 4);
    }
}
