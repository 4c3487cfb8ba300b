//! Connection handling
//!
//! A framed TCP stream before it becomes a `Link`: message encoding and
//! decoding plus the authenticated hello/welcome handshake.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::link::CloseReason;
use crate::protocol::{
    CodecError, Decoder, Encoder, Frame, Handshake, Message, Rejection, ScreenInfo,
    PROTOCOL_VERSION,
};

/// Link errors
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Authentication failed: token mismatch")]
    Authentication,

    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Link closed")]
    Closed,

    #[error("Link lost: {0}")]
    Lost(CloseReason),
}

pub type LinkResult<T> = Result<T, LinkError>;

/// A framed stream to a remote host
pub struct Connection {
    remote_addr: SocketAddr,
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

/// Compare tokens without short-circuiting on the first differing byte
fn tokens_match(expected: &str, presented: &str) -> bool {
    let a = expected.as_bytes();
    let b = presented.as_bytes();
    let mut diff = a.len() ^ b.len();
    for (i, byte) in a.iter().enumerate() {
        diff |= usize::from(byte ^ b.get(i).copied().unwrap_or(0));
    }
    diff == 0
}

impl Connection {
    /// Wrap an established TCP stream
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            remote_addr,
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Send a message
    pub async fn send(&mut self, message: &Message) -> LinkResult<()> {
        self.write_buf.clear();
        self.encoder.encode(message, &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive the next frame, `None` on a clean close
    pub async fn recv(&mut self) -> LinkResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                return Ok(Some(frame));
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(LinkError::Closed);
            }
        }
    }

    /// Receive with a deadline
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
        during: &'static str,
    ) -> LinkResult<Option<Frame>> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| LinkError::Timeout(during))?
    }

    async fn recv_handshake(&mut self, timeout: Duration) -> LinkResult<Handshake> {
        let frame = self
            .recv_timeout(timeout, "handshake")
            .await?
            .ok_or_else(|| LinkError::Handshake("connection closed during handshake".to_string()))?;
        match frame.message {
            Message::Handshake(handshake) => Ok(handshake),
            other => Err(LinkError::Handshake(format!(
                "expected handshake, got {:?}",
                other.kind()
            ))),
        }
    }

    /// Connecting side: send Hello with our token, wait for Welcome.
    /// Returns the remote screen.
    pub async fn handshake_initiator(
        &mut self,
        local: &ScreenInfo,
        token: &str,
        timeout: Duration,
    ) -> LinkResult<ScreenInfo> {
        self.send(&Message::Handshake(Handshake::Hello {
            protocol_version: PROTOCOL_VERSION,
            token: token.to_string(),
            screen: local.clone(),
        }))
        .await?;

        match self.recv_handshake(timeout).await? {
            Handshake::Welcome {
                protocol_version,
                screen,
                accepted,
                reason,
            } => {
                if !accepted {
                    return Err(match reason {
                        Some(Rejection::BadToken) => LinkError::Authentication,
                        Some(Rejection::VersionMismatch) => LinkError::VersionMismatch {
                            local: PROTOCOL_VERSION,
                            remote: protocol_version,
                        },
                        None => LinkError::Handshake("connection rejected".to_string()),
                    });
                }
                if protocol_version != PROTOCOL_VERSION {
                    return Err(LinkError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }
                tracing::info!(peer = %screen.name, addr = %self.remote_addr, "handshake complete (initiator)");
                Ok(screen)
            }
            Handshake::Hello { .. } => Err(LinkError::Handshake(
                "expected Welcome, got Hello".to_string(),
            )),
        }
    }

    /// Accepting side: wait for Hello, check version then token, reply.
    /// Returns the remote screen.
    pub async fn handshake_responder(
        &mut self,
        local: &ScreenInfo,
        token: &str,
        timeout: Duration,
    ) -> LinkResult<ScreenInfo> {
        let (remote_version, remote_token, remote_screen) = match self.recv_handshake(timeout).await? {
            Handshake::Hello {
                protocol_version,
                token,
                screen,
            } => (protocol_version, token, screen),
            Handshake::Welcome { .. } => {
                return Err(LinkError::Handshake(
                    "expected Hello, got Welcome".to_string(),
                ))
            }
        };

        let rejection = if remote_version != PROTOCOL_VERSION {
            Some(Rejection::VersionMismatch)
        } else if !tokens_match(token, &remote_token) {
            Some(Rejection::BadToken)
        } else {
            None
        };

        self.send(&Message::Handshake(Handshake::Welcome {
            protocol_version: PROTOCOL_VERSION,
            screen: local.clone(),
            accepted: rejection.is_none(),
            reason: rejection,
        }))
        .await?;

        match rejection {
            Some(Rejection::VersionMismatch) => Err(LinkError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: remote_version,
            }),
            Some(Rejection::BadToken) => {
                tracing::warn!(addr = %self.remote_addr, node = %remote_screen.node_id, "rejected link: token mismatch");
                Err(LinkError::Authentication)
            }
            None => {
                tracing::info!(peer = %remote_screen.name, addr = %self.remote_addr, "handshake complete (responder)");
                Ok(remote_screen)
            }
        }
    }

    /// Split into the halves a `Link` drives, keeping buffered bytes and
    /// codec state
    pub(super) fn into_parts(self) -> (OwnedReadHalf, OwnedWriteHalf, Encoder, Decoder, BytesMut) {
        let (read, write) = self.stream.into_split();
        (read, write, self.encoder, self.decoder, self.read_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (Connection::new(client, addr), Connection::new(server, peer))
    }

    fn screen(id: &str) -> ScreenInfo {
        ScreenInfo::new(id, id, 1920, 1080)
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("secret", "secret"));
        assert!(!tokens_match("secret", "secreT"));
        assert!(!tokens_match("secret", "secret2"));
        assert!(!tokens_match("secret", ""));
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (mut client, mut server) = pair().await;
        let timeout = Duration::from_secs(2);

        let responder = tokio::spawn(async move {
            server
                .handshake_responder(&screen("node"), "token", timeout)
                .await
        });
        let remote = client
            .handshake_initiator(&screen("controller"), "token", timeout)
            .await
            .unwrap();
        assert_eq!(remote.node_id, "node");
        assert_eq!(responder.await.unwrap().unwrap().node_id, "controller");
    }

    #[tokio::test]
    async fn test_handshake_bad_token() {
        let (mut client, mut server) = pair().await;
        let timeout = Duration::from_secs(2);

        let responder = tokio::spawn(async move {
            server
                .handshake_responder(&screen("node"), "right", timeout)
                .await
        });
        let result = client
            .handshake_initiator(&screen("controller"), "wrong", timeout)
            .await;
        assert!(matches!(result, Err(LinkError::Authentication)));
        assert!(matches!(responder.await.unwrap(), Err(LinkError::Authentication)));
    }

    #[tokio::test]
    async fn test_handshake_version_mismatch() {
        let (mut client, mut server) = pair().await;
        let timeout = Duration::from_secs(2);

        let responder = tokio::spawn(async move {
            server
                .handshake_responder(&screen("node"), "token", timeout)
                .await
        });
        client
            .send(&Message::Handshake(Handshake::Hello {
                protocol_version: PROTOCOL_VERSION + 1,
                token: "token".to_string(),
                screen: screen("controller"),
            }))
            .await
            .unwrap();

        let frame = client.recv().await.unwrap().unwrap();
        assert!(matches!(
            frame.message,
            Message::Handshake(Handshake::Welcome {
                accepted: false,
                reason: Some(Rejection::VersionMismatch),
                ..
            })
        ));
        assert!(matches!(
            responder.await.unwrap(),
            Err(LinkError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (_client, mut server) = pair().await;
        let result = server
            .handshake_responder(&screen("node"), "token", Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(LinkError::Timeout("handshake"))));
    }
}
