//! # Connection Handler
//!
//! Drives one accepted peer from TCP accept to disconnect and fans its messages
//! out to every other registered peer.
//!
//! ## Lifecycle:
//! ```text
//! Connecting ──▶ Handshaking ──▶ Open ──▶ Closed
//!                     │                    ▲
//!                     └────────────────────┘  (bad or missing key)
//! ```
//! - **Handshaking**: read the upgrade request and answer `101`
//! - **Open**: registered; every non-empty text message is broadcast to the others
//! - **Closed**: deregistered and transport shut down, whatever caused the close
//!
//! Deregistration is tied to a drop guard, so it also happens when the handler's
//! task is aborted during shutdown.
//!
//! ## Broadcast:
//! The member list is snapshotted under the registry lock, then the lock is
//! released and the frame is written to every peer concurrently with a per-peer
//! deadline. A failing peer is logged and skipped; it is removed later by its own
//! handler when that handler sees the disconnect. The sender is never told about
//! partial failures.

use crate::error::{FrameDecodeError, HandshakeError};
use crate::frame::{self, Opcode, CLOSE_GOING_AWAY};
use crate::handshake;
use crate::registry::{ClientRegistry, ConnectionId, Peer};
use crate::state::ServerState;
use chrono::Utc;
use futures_util::future::join_all;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Close status for frames the server cannot handle.
const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Open,
    Closed,
}

/// Why a connection reached `Closed`.
#[derive(Debug)]
pub enum CloseReason {
    /// The upgrade never completed; the peer was never registered.
    HandshakeFailed(HandshakeError),
    /// Zero-length read or EOF mid-frame.
    PeerClosed,
    /// The peer sent a Close frame.
    CloseRequested,
    /// A frame could not be decoded or used an unsupported opcode.
    ProtocolError(FrameDecodeError),
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Frame to send before shutting the transport, if any.
    fn farewell_frame(&self) -> Option<Vec<u8>> {
        match self {
            CloseReason::CloseRequested => Some(frame::encode_close(None)),
            CloseReason::ProtocolError(_) => Some(frame::encode_close(Some(CLOSE_PROTOCOL_ERROR))),
            CloseReason::Shutdown => Some(frame::encode_close(Some(CLOSE_GOING_AWAY))),
            CloseReason::HandshakeFailed(_) | CloseReason::PeerClosed => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::HandshakeFailed(err) => write!(f, "handshake failed: {err}"),
            CloseReason::PeerClosed => write!(f, "peer closed the connection"),
            CloseReason::CloseRequested => write!(f, "peer sent close frame"),
            CloseReason::ProtocolError(err) => write!(f, "protocol error: {err}"),
            CloseReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Send `message` to every registered peer except `sender`.
pub async fn broadcast(
    registry: &ClientRegistry,
    sender: ConnectionId,
    message: &str,
    write_timeout: Duration,
) -> BroadcastReport {
    let peers = registry.snapshot_excluding(sender);
    if peers.is_empty() {
        return BroadcastReport::default();
    }

    let encoded = frame::encode(message);
    let results = join_all(peers.iter().map(|peer| peer.send(&encoded, write_timeout))).await;

    let mut report = BroadcastReport::default();
    for (peer, result) in peers.iter().zip(results) {
        match result {
            Ok(()) => report.delivered += 1,
            Err(err) => {
                warn!(connection = %peer.id(), peer = %peer.addr(), error = %err, "Broadcast write failed");
                report.failed += 1;
            }
        }
    }
    report
}

/// One peer's handler.
pub struct ConnectionHandler {
    id: ConnectionId,
    addr: SocketAddr,
    state: ConnectionState,
    server: ServerState,
    cancel: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(addr: SocketAddr, server: ServerState, cancel: CancellationToken) -> Self {
        Self {
            id: ConnectionId::new(),
            addr,
            state: ConnectionState::Connecting,
            server,
            cancel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!(connection = %self.id, from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }

    /// Run the connection to completion and report why it closed.
    pub async fn run<S>(mut self, stream: S) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let started = Instant::now();
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        self.transition(ConnectionState::Handshaking);
        let limit = self.server.config.limits.handshake_buffer_size;
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = handshake::perform_handshake(&mut reader, &mut write_half, limit) => Some(result),
        };

        match outcome {
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!(connection = %self.id, peer = %self.addr, error = %err, "Handshake failed");
                self.server.metrics.record_handshake_failed();
                if let Err(err) = write_half.shutdown().await {
                    debug!(connection = %self.id, error = %err, "Transport close failed");
                }
                self.transition(ConnectionState::Closed);
                return CloseReason::HandshakeFailed(err);
            }
            None => {
                if let Err(err) = write_half.shutdown().await {
                    debug!(connection = %self.id, error = %err, "Transport close failed");
                }
                self.transition(ConnectionState::Closed);
                return CloseReason::Shutdown;
            }
        }

        let peer = Peer::new(self.id, self.addr, write_half);
        let registration = self.server.registry.join(peer.clone());
        self.transition(ConnectionState::Open);
        debug!(connection = %self.id, peers = self.server.registry.len(), "Handshake complete");

        let reason = self.receive_loop(&mut reader).await;

        drop(registration);
        if let Some(farewell) = reason.farewell_frame() {
            if let Err(err) = peer.send(&farewell, self.server.write_timeout()).await {
                debug!(connection = %self.id, error = %err, "Close frame not delivered");
            }
        }
        if let Err(err) = peer.close().await {
            debug!(connection = %self.id, error = %err, "Transport close failed");
        }
        self.transition(ConnectionState::Closed);

        info!(
            connection = %self.id,
            peer = %self.addr,
            duration_ms = started.elapsed().as_millis() as u64,
            open_ms = (Utc::now() - peer.connected_at()).num_milliseconds(),
            "Connection closed: {}",
            reason
        );
        reason
    }

    async fn receive_loop<R>(&mut self, reader: &mut R) -> CloseReason
    where
        R: AsyncBufRead + Unpin,
    {
        let max_frame_size = self.server.config.limits.max_frame_size;

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return CloseReason::Shutdown,
                result = frame::read_frame(reader, max_frame_size) => result,
            };

            let frame = match result {
                Ok(frame) => frame,
                Err(err) if err.is_peer_closed() => return CloseReason::PeerClosed,
                Err(err) => return CloseReason::ProtocolError(err),
            };

            match frame.opcode {
                Opcode::Text => {
                    let message = match frame.into_text() {
                        Ok(message) => message,
                        Err(err) => return CloseReason::ProtocolError(err),
                    };
                    if message.is_empty() {
                        trace!(connection = %self.id, "Ignoring empty message");
                        continue;
                    }

                    debug!(connection = %self.id, len = message.len(), "Received message");
                    self.server.metrics.record_message();
                    let report = broadcast(&self.server.registry, self.id, &message, self.server.write_timeout()).await;
                    self.server.metrics.record_broadcast(report.delivered, report.failed);
                }
                Opcode::Close => return CloseReason::CloseRequested,
                Opcode::Ping | Opcode::Pong => {
                    trace!(connection = %self.id, opcode = ?frame.opcode, "Ignoring control frame");
                }
                other => {
                    return CloseReason::ProtocolError(FrameDecodeError::UnsupportedOpcode(other.as_byte()));
                }
            }
        }
    }
}
