//! Link listener
//!
//! Accepts TCP connections and runs the responder handshake for each on its
//! own task, so a slow or hostile client cannot hold up other accepts.
//! Established links and failed attempts are reported over a channel.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use super::connection::{LinkError, LinkResult};
use super::link::Link;
use super::LinkConfig;
use crate::protocol::ScreenInfo;

/// Events emitted by the listener
#[derive(Debug)]
pub enum ListenerEvent {
    /// A remote completed the handshake
    Accepted(Link),
    /// A remote connected but the handshake failed
    Rejected { addr: SocketAddr, error: LinkError },
}

/// Accepts inbound links until stopped or dropped
pub struct Listener {
    local_addr: SocketAddr,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl Listener {
    /// Bind and start accepting
    pub async fn bind(
        bind_addr: SocketAddr,
        local: ScreenInfo,
        token: String,
        config: LinkConfig,
        events: mpsc::Sender<ListenerEvent>,
    ) -> LinkResult<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Listening for links on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let shared = Arc::new((local, token, config));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::debug!("Inbound connection from {}", addr);
                                let shared = shared.clone();
                                let events = events.clone();
                                tokio::spawn(async move {
                                    let (local, token, config) = &*shared;
                                    let event = match Link::accept(stream, addr, local, token, config).await {
                                        Ok(link) => ListenerEvent::Accepted(link),
                                        Err(error) => {
                                            tracing::warn!(%addr, error = %error, "inbound link rejected");
                                            ListenerEvent::Rejected { addr, error }
                                        }
                                    };
                                    let _ = events.send(event).await;
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Listener stopped");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Established links are unaffected.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlMessage, Message};
    use std::time::Duration;

    fn screen(id: &str) -> ScreenInfo {
        ScreenInfo::new(id, id, 1280, 720)
    }

    #[tokio::test]
    async fn test_listener_accepts_and_rejects() {
        let (tx, mut rx) = mpsc::channel(8);
        let config = LinkConfig::default();
        let mut listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            screen("node"),
            "secret".to_string(),
            config.clone(),
            tx,
        )
        .await
        .unwrap();
        let addr = listener.local_addr();

        let bad = Link::connect(addr, &screen("intruder"), "guess", &config).await;
        assert!(matches!(bad, Err(LinkError::Authentication)));
        match rx.recv().await.unwrap() {
            ListenerEvent::Rejected { error, .. } => {
                assert!(matches!(error, LinkError::Authentication))
            }
            other => panic!("unexpected {:?}", other),
        }

        let controller = Link::connect(addr, &screen("controller"), "secret", &config)
            .await
            .unwrap();
        let mut accepted = match rx.recv().await.unwrap() {
            ListenerEvent::Accepted(link) => link,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(accepted.node_id(), "controller");

        controller
            .send(Message::Control(ControlMessage::Revoke))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), accepted.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.message, Message::Control(ControlMessage::Revoke));

        listener.stop().await;
    }
}
