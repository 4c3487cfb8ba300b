//! Session module - input ownership and the services that drive it
//!
//! - `SessionMachine`: the controller's ownership state machine
//! - `PeerSession`: the node's side of a handoff
//! - `Controller` / `NodeService`: single-consumer service loops that own
//!   the state, apply its decisions, and run links, discovery and input

mod controller;
mod machine;
mod peer;
mod state;

pub use controller::*;
pub use machine::*;
pub use peer::*;
pub use state::*;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ConfigError;
use crate::input::InputError;
use crate::network::{CloseReason, LinkError, LinkReceiver};
use crate::protocol::Frame;
use crate::registry::NodeId;

/// Errors that stop a service from starting
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Network error: {0}")]
    Link(#[from] LinkError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Traffic from one established link. `generation` tells a replaced link's
/// late events apart from its successor's.
#[derive(Debug)]
pub enum LinkEvent {
    Frame {
        node: NodeId,
        generation: u64,
        frame: Frame,
    },
    Closed {
        node: NodeId,
        generation: u64,
        reason: CloseReason,
    },
}

/// Forward a link's frames, then its close, into a service queue
pub(crate) fn spawn_link_pump<E, F>(
    node: NodeId,
    generation: u64,
    mut receiver: LinkReceiver,
    events: mpsc::Sender<E>,
    wrap: F,
) where
    E: Send + 'static,
    F: Fn(LinkEvent) -> E + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = receiver.receive().await {
            let event = LinkEvent::Frame {
                node: node.clone(),
                generation,
                frame,
            };
            if events.send(wrap(event)).await.is_err() {
                return;
            }
        }
        let reason = receiver
            .close_reason()
            .unwrap_or_else(|| CloseReason::Local("receiver ended".to_string()));
        let _ = events
            .send(wrap(LinkEvent::Closed {
                node,
                generation,
                reason,
            }))
            .await;
    });
}
