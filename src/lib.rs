//! # ws-relay-server
//!
//! A small WebSocket relay: every text message a client sends is delivered to
//! every other connected client.
//!
//! ## Module Layout:
//! - **frame**: WebSocket frame encode/decode (pure) plus a one-frame stream reader
//! - **handshake**: HTTP upgrade request parsing and the `101` response
//! - **registry**: the live set of connected peers
//! - **connection**: one peer's lifecycle and message fan-out
//! - **server**: accept loop, connection cap and graceful shutdown
//! - **state**: configuration, registry and counters shared by handlers
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **error**: error types, one per failure domain

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod registry;
pub mod server;
pub mod state;

pub use crate::config::AppConfig;
pub use error::{BroadcastWriteError, FrameDecodeError, HandshakeError, ServerError};
pub use server::Server;

/// Listen on `host:port` with default limits and relay messages until the
/// process exits.
///
/// Use [`Server`] directly when the caller needs to stop the server or inspect it.
pub async fn start(host: &str, port: u16) -> Result<(), ServerError> {
    Server::new(AppConfig::with_address(host, port)).run().await
}
