//! Established links
//!
//! After the handshake a connection is split into a reader task and a writer
//! task. The writer drains an outbound queue and sends a heartbeat whenever it
//! has been idle for the heartbeat interval. The reader forwards frames to the
//! owner and closes the link if nothing arrives within the link timeout.
//! Whichever side notices the close first records the reason; the other task
//! stops on the same signal.

use bytes::BytesMut;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use super::connection::{Connection, LinkError, LinkResult};
use super::LinkConfig;
use crate::protocol::{ControlMessage, Decoder, Encoder, Frame, Message, ScreenInfo};

/// How long `close` waits for queued frames and the disconnect to go out
/// before cutting the link
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Why a link ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this side
    Local(String),
    /// The remote sent a disconnect or closed the stream
    Remote(String),
    /// No inbound traffic within the link timeout
    HeartbeatTimeout,
    /// The remote sent bytes that do not decode
    Protocol(String),
    /// Socket error
    Io(String),
}

impl CloseReason {
    /// Anything not initiated locally counts as a lost link
    pub fn is_lost(&self) -> bool {
        !matches!(self, CloseReason::Local(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local(reason) => write!(f, "closed locally: {}", reason),
            CloseReason::Remote(reason) => write!(f, "closed by remote: {}", reason),
            CloseReason::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            CloseReason::Protocol(e) => write!(f, "protocol error: {}", e),
            CloseReason::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

enum Outbound {
    Message(Message),
    Close(String),
}

/// Records the first close reason and wakes both tasks
#[derive(Clone)]
struct CloseSignal(Arc<watch::Sender<Option<CloseReason>>>);

impl CloseSignal {
    fn set(&self, reason: CloseReason) -> bool {
        self.0.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }
}

async fn wait_closed(rx: &mut watch::Receiver<Option<CloseReason>>) {
    let _ = rx.wait_for(|reason| reason.is_some()).await;
}

/// Cloneable sending side of a link
#[derive(Clone)]
pub struct LinkHandle {
    node_id: String,
    outbound: mpsc::Sender<Outbound>,
    signal: CloseSignal,
    closed: watch::Receiver<Option<CloseReason>>,
}

impl LinkHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.borrow().clone()
    }

    /// `Closed` after a local close, `Lost` otherwise
    fn check_open(&self) -> LinkResult<()> {
        match self.close_reason() {
            None => Ok(()),
            Some(reason) if reason.is_lost() => Err(LinkError::Lost(reason)),
            Some(_) => Err(LinkError::Closed),
        }
    }

    /// Queue a message, waiting for queue space
    pub async fn send(&self, message: Message) -> LinkResult<()> {
        self.check_open()?;
        self.outbound
            .send(Outbound::Message(message))
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Queue a message without waiting. A full queue means the remote has
    /// stopped draining and is reported as `Timeout`.
    pub fn try_send(&self, message: Message) -> LinkResult<()> {
        self.check_open()?;
        self.outbound
            .try_send(Outbound::Message(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => LinkError::Timeout("send queue full"),
                mpsc::error::TrySendError::Closed(_) => LinkError::Closed,
            })
    }

    /// Send a disconnect after anything already queued, then close. A
    /// remote that stops draining gets cut off after `CLOSE_GRACE`.
    pub async fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let orderly = async {
            if self.outbound.send(Outbound::Close(reason.clone())).await.is_ok() {
                self.closed().await;
            }
        };
        if tokio::time::timeout(CLOSE_GRACE, orderly).await.is_err()
            && self.signal.set(CloseReason::Local(reason.clone()))
        {
            tracing::debug!(node = %self.node_id, "link cut after close grace");
        }
    }

    /// Wait until the link has closed and return why
    pub async fn closed(&self) -> Option<CloseReason> {
        let mut rx = self.closed.clone();
        wait_closed(&mut rx).await;
        let reason = rx.borrow().clone();
        reason
    }
}

impl fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkHandle")
            .field("node_id", &self.node_id)
            .field("closed", &self.close_reason())
            .finish()
    }
}

/// Receiving side of a link
pub struct LinkReceiver {
    inbound: mpsc::Receiver<Frame>,
    closed: watch::Receiver<Option<CloseReason>>,
}

impl LinkReceiver {
    /// Next frame, `None` once the link has closed. Heartbeats and the
    /// remote's disconnect are consumed by the link itself.
    pub async fn receive(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.borrow().clone()
    }
}

/// An authenticated link to one remote screen
pub struct Link {
    remote: ScreenInfo,
    addr: SocketAddr,
    handle: LinkHandle,
    receiver: LinkReceiver,
}

impl Link {
    /// Connect to `addr` and run the initiating side of the handshake
    pub async fn connect(
        addr: SocketAddr,
        local: &ScreenInfo,
        token: &str,
        config: &LinkConfig,
    ) -> LinkResult<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| LinkError::Timeout("connect"))??;

        let mut conn = Connection::new(stream, addr);
        let remote = conn
            .handshake_initiator(local, token, config.handshake_timeout)
            .await?;
        Ok(Self::spawn(conn, remote, config))
    }

    /// Run the accepting side of the handshake on an inbound stream
    pub async fn accept(
        stream: TcpStream,
        addr: SocketAddr,
        local: &ScreenInfo,
        token: &str,
        config: &LinkConfig,
    ) -> LinkResult<Self> {
        let mut conn = Connection::new(stream, addr);
        let remote = conn
            .handshake_responder(local, token, config.handshake_timeout)
            .await?;
        Ok(Self::spawn(conn, remote, config))
    }

    fn spawn(conn: Connection, remote: ScreenInfo, config: &LinkConfig) -> Self {
        let addr = conn.remote_addr();
        let (read_half, write_half, encoder, decoder, read_buf) = conn.into_parts();

        let (closed_tx, closed_rx) = watch::channel(None);
        let signal = CloseSignal(Arc::new(closed_tx));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.send_queue.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.send_queue.max(1));

        tokio::spawn(write_loop(
            write_half,
            encoder,
            outbound_rx,
            config.heartbeat_interval,
            signal.clone(),
            closed_rx.clone(),
        ));
        tokio::spawn(read_loop(
            read_half,
            decoder,
            read_buf,
            inbound_tx,
            config.link_timeout,
            signal.clone(),
            closed_rx.clone(),
        ));

        Self {
            handle: LinkHandle {
                node_id: remote.node_id.clone(),
                outbound: outbound_tx,
                signal: signal.clone(),
                closed: closed_rx.clone(),
            },
            receiver: LinkReceiver {
                inbound: inbound_rx,
                closed: closed_rx,
            },
            remote,
            addr,
        }
    }

    pub fn remote(&self) -> &ScreenInfo {
        &self.remote
    }

    pub fn node_id(&self) -> &str {
        &self.remote.node_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    pub async fn send(&self, message: Message) -> LinkResult<()> {
        self.handle.send(message).await
    }

    pub async fn receive(&mut self) -> Option<Frame> {
        self.receiver.receive().await
    }

    pub async fn close(&self, reason: impl Into<String>) {
        self.handle.close(reason).await
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.handle.close_reason()
    }

    /// Separate the sending and receiving sides
    pub fn split(self) -> (LinkHandle, LinkReceiver) {
        (self.handle, self.receiver)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("node_id", &self.remote.node_id)
            .field("addr", &self.addr)
            .finish()
    }
}

async fn write_frame(
    write_half: &mut OwnedWriteHalf,
    encoder: &mut Encoder,
    buf: &mut BytesMut,
    message: &Message,
) -> LinkResult<()> {
    buf.clear();
    encoder.encode(message, buf)?;
    write_half.write_all(buf).await?;
    write_half.flush().await?;
    Ok(())
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut encoder: Encoder,
    mut outbound: mpsc::Receiver<Outbound>,
    heartbeat_interval: Duration,
    signal: CloseSignal,
    mut closed: watch::Receiver<Option<CloseReason>>,
) {
    let mut buf = BytesMut::with_capacity(4096);
    let idle = tokio::time::sleep(heartbeat_interval);
    tokio::pin!(idle);

    loop {
        let message = tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Message(message)) => message,
                Some(Outbound::Close(reason)) => {
                    let disconnect = Message::disconnect(reason.clone());
                    tokio::select! {
                        _ = write_frame(&mut write_half, &mut encoder, &mut buf, &disconnect) => {}
                        _ = wait_closed(&mut closed) => {}
                    }
                    let _ = write_half.shutdown().await;
                    signal.set(CloseReason::Local(reason));
                    break;
                }
                None => {
                    signal.set(CloseReason::Local("link dropped".to_string()));
                    let _ = write_half.shutdown().await;
                    break;
                }
            },
            _ = &mut idle => Message::heartbeat(),
            _ = wait_closed(&mut closed) => break,
        };

        let result = tokio::select! {
            result = write_frame(&mut write_half, &mut encoder, &mut buf, &message) => result,
            _ = wait_closed(&mut closed) => break,
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "link write failed");
            signal.set(match e {
                LinkError::Protocol(e) => CloseReason::Protocol(e.to_string()),
                other => CloseReason::Io(other.to_string()),
            });
            break;
        }
        idle.as_mut()
            .reset(tokio::time::Instant::now() + heartbeat_interval);
    }
}

/// Read one frame, `None` on EOF
async fn read_frame(
    read_half: &mut OwnedReadHalf,
    decoder: &mut Decoder,
    buf: &mut BytesMut,
) -> LinkResult<Option<Frame>> {
    loop {
        if let Some(frame) = decoder.decode(buf)? {
            return Ok(Some(frame));
        }
        if read_half.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    mut decoder: Decoder,
    mut buf: BytesMut,
    inbound: mpsc::Sender<Frame>,
    link_timeout: Duration,
    signal: CloseSignal,
    mut closed: watch::Receiver<Option<CloseReason>>,
) {
    loop {
        let result = tokio::select! {
            result = tokio::time::timeout(link_timeout, read_frame(&mut read_half, &mut decoder, &mut buf)) => result,
            _ = wait_closed(&mut closed) => break,
        };

        let reason = match result {
            Err(_) => CloseReason::HeartbeatTimeout,
            Ok(Ok(Some(frame))) => match frame.message {
                Message::Heartbeat(_) => continue,
                Message::Control(ControlMessage::Disconnect { reason }) => CloseReason::Remote(reason),
                _ => {
                    if inbound.send(frame).await.is_err() {
                        CloseReason::Local("receiver dropped".to_string())
                    } else {
                        continue;
                    }
                }
            },
            Ok(Ok(None)) => CloseReason::Remote("connection closed".to_string()),
            Ok(Err(LinkError::Protocol(e))) => CloseReason::Protocol(e.to_string()),
            Ok(Err(e)) => CloseReason::Io(e.to_string()),
        };

        if signal.set(reason.clone()) {
            tracing::info!(reason = %reason, "link closed");
        }
        break;
    }
}
