//! # WebSocket Server
//!
//! Owns the listening socket and spawns one [`ConnectionHandler`] task per
//! accepted connection. The accept loop never waits on a handler, and no handler
//! error ever reaches it.
//!
//! ## Admission:
//! At most `limits.max_connections` handlers run at once. A connection accepted
//! beyond that is closed straight away, before any handshake.
//!
//! ## Shutdown:
//! [`Server::shutdown`] cancels the pending accept and every handler's child token.
//! Handlers send a Close frame, deregister and close their transport; whatever is
//! still running after `limits.shutdown_grace_ms` is aborted.

use crate::config::AppConfig;
use crate::connection::ConnectionHandler;
use crate::error::ServerError;
use crate::registry::ClientRegistry;
use crate::state::{MetricsSnapshot, ServerState};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept (e.g. out of file descriptors) before retrying.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server {
    state: ServerState,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(config: AppConfig) -> Arc<Self> {
        Arc::new(Self {
            state: ServerState::new(config),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.state.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.state.metrics.snapshot()
    }

    /// Address actually bound. `None` until [`Server::run`] has bound the socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Resolve the configured address and listen with `SO_REUSEADDR`.
    async fn bind(&self) -> Result<TcpListener, ServerError> {
        let address = self.state.config.bind_address();
        let socket_addr = tokio::net::lookup_host(address.as_str())
            .await
            .map_err(|err| ServerError::InvalidAddress { addr: address.clone(), reason: err.to_string() })?
            .next()
            .ok_or_else(|| ServerError::InvalidAddress {
                addr: address.clone(),
                reason: "no addresses resolved".to_string(),
            })?;

        let socket = if socket_addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_reuseaddr(true)?;
        socket.bind(socket_addr)?;
        Ok(socket.listen(self.state.config.server.backlog)?)
    }

    /// Accept connections until [`Server::shutdown`] is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        info!("WebSocket server running at ws://{}", local_addr);

        let permits = Arc::new(Semaphore::new(self.state.config.limits.max_connections));
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Shutdown requested, closing {} connection(s)", handlers.len());
                    break;
                }

                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(err) = joined {
                        if err.is_panic() {
                            error!("Connection handler panicked: {}", err);
                        }
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => match Arc::clone(&permits).try_acquire_owned() {
                        Ok(permit) => {
                            self.state.metrics.record_accepted();
                            let handler = ConnectionHandler::new(peer_addr, self.state.clone(), self.cancel.child_token());
                            info!(connection = %handler.id(), "New connection from {}", peer_addr);
                            handlers.spawn(async move {
                                let _permit = permit;
                                handler.run(stream).await;
                            });
                        }
                        Err(_) => {
                            warn!(peer = %peer_addr, "Connection limit reached, rejecting");
                            self.state.metrics.record_rejected();
                            drop(stream);
                        }
                    },
                    Err(err) => {
                        error!("Accept error: {}", err);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        self.drain(&mut handlers).await;

        let metrics = self.metrics();
        info!(
            uptime_seconds = self.state.uptime_seconds(),
            accepted = metrics.connections_accepted,
            rejected = metrics.connections_rejected,
            handshakes_failed = metrics.handshakes_failed,
            messages = metrics.messages_received,
            delivered = metrics.frames_delivered,
            write_failures = metrics.write_failures,
            "Server stopped"
        );
        Ok(())
    }

    /// Give running handlers the grace period to finish, then abort the rest.
    async fn drain(&self, handlers: &mut JoinSet<()>) {
        let grace = Duration::from_millis(self.state.config.limits.shutdown_grace_ms);
        let finished = tokio::time::timeout(grace, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            warn!(remaining = handlers.len(), "Grace period elapsed, aborting connections");
            handlers.shutdown().await;
        } else {
            debug!("All connections closed");
        }
    }
}
