//! # Error Handling
//!
//! This module defines the error types produced by the WebSocket relay.
//! Every error is scoped to the connection that caused it: nothing here is ever
//! allowed to reach the accept loop or another peer's handler.
//!
//! ## Error Taxonomy:
//! - **HandshakeError**: the HTTP upgrade request was missing, malformed or too large.
//!   The connection is closed without ever being registered.
//! - **FrameDecodeError**: a frame could not be read or decoded. The
//!   `ConnectionClosed` variant is the normal "peer went away" outcome; every other
//!   variant is a protocol failure. Both end the connection the same way.
//! - **BroadcastWriteError**: writing a frame to one peer during fan-out failed.
//!   Logged and counted, then delivery continues with the remaining peers.
//! - **ServerError**: the listener itself could not be set up.
//!
//! ## Rust Concepts:
//! - **thiserror**: derives `Display` and `std::error::Error` from the `#[error]` attributes
//! - **#[from]**: generates a `From` impl so `?` converts the source error automatically
//! - **#[source]**: keeps the underlying error reachable through `Error::source()`

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failures while upgrading a TCP connection to a WebSocket.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peer closed the connection before sending a complete request.
    #[error("connection closed before the upgrade request was complete")]
    ConnectionClosed,

    /// The request header block did not fit in the handshake buffer.
    #[error("upgrade request exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    /// The request was not valid UTF-8 text or had no request line.
    #[error("malformed upgrade request: {0}")]
    Malformed(String),

    /// The `Sec-WebSocket-Key` header was absent or empty.
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    /// Reading the request or writing the 101 response failed.
    #[error("handshake I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures while reading or decoding a single frame.
#[derive(Debug, Error)]
pub enum FrameDecodeError {
    /// Zero-length read or a Close frame: the peer ended the session.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The buffer ended before the declared header or payload did.
    #[error("truncated frame: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// The declared payload length exceeds the configured frame limit.
    #[error("frame payload of {declared} bytes exceeds limit of {limit}")]
    FrameTooLarge { declared: u64, limit: usize },

    /// Binary, continuation or reserved opcodes are not handled.
    #[error("unsupported opcode 0x{0:x}")]
    UnsupportedOpcode(u8),

    /// A text frame carried bytes that are not valid UTF-8.
    #[error("text frame is not valid UTF-8")]
    InvalidUtf8(#[source] std::string::FromUtf8Error),

    /// The transport failed mid-frame.
    #[error("frame I/O error: {0}")]
    Io(#[source] io::Error),
}

impl FrameDecodeError {
    /// Returns true when the error is an orderly close rather than a failure.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, FrameDecodeError::ConnectionClosed)
    }
}

/// `UnexpectedEof` from the transport means the peer hung up mid-frame,
/// which is reported the same way as any other closed connection.
impl From<io::Error> for FrameDecodeError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => FrameDecodeError::ConnectionClosed,
            _ => FrameDecodeError::Io(err),
        }
    }
}

/// Failure to deliver one broadcast frame to one peer.
#[derive(Debug, Error)]
pub enum BroadcastWriteError {
    #[error("write failed: {0}")]
    Io(#[from] io::Error),

    #[error("write timed out after {0:?}")]
    TimedOut(Duration),

    /// An earlier write to this peer failed; nothing more is sent to it.
    #[error("peer stream abandoned after a failed write")]
    PeerBroken,
}

/// Failures of the server itself (not of any single connection).
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configured host/port could not be resolved to a socket address.
    #[error("invalid listen address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
