//! # Client Registry
//!
//! The set of peers that completed the handshake and have not yet disconnected.
//! Broadcasts read from it; connection handlers join and leave it.
//!
//! ## Thread Safety:
//! One `std::sync::Mutex` guards the member list. Every join, leave and snapshot
//! takes that same lock, and the lock is never held across an `.await`: a broadcast
//! copies the members it needs (cheap `Arc` clones) and releases the lock before
//! writing to anyone, so a stalled peer cannot block membership changes.
//!
//! ## Rust Concepts:
//! - **Arc<Mutex<Vec<Peer>>>**: shared ownership of one ordered member list
//! - **Drop guard**: [`Registration`] removes its peer when it goes out of scope,
//!   so deregistration happens on every exit path of a handler
//! - **PoisonError::into_inner**: a panic while holding the lock leaves a plain
//!   list behind, which is still safe to use

use crate::error::BroadcastWriteError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

/// Write half of a peer's transport.
pub type PeerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stable identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered peer: its identity plus a shared handle to its write half.
///
/// Cloning a `Peer` clones the handle, not the transport. Writes from different
/// broadcasters are serialized by the inner async mutex so frames never interleave.
///
/// A write that fails or times out may leave part of a frame on the wire. After
/// that the peer is marked broken: its writer is shut down and every later send
/// fails without writing, so no frame ever follows a truncated one.
#[derive(Clone)]
pub struct Peer {
    id: ConnectionId,
    addr: SocketAddr,
    connected_at: DateTime<Utc>,
    writer: Arc<tokio::sync::Mutex<PeerWriter>>,
    broken: Arc<AtomicBool>,
}

impl Peer {
    pub fn new<W>(id: ConnectionId, addr: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            addr,
            connected_at: Utc::now(),
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// True once a write to this peer has failed.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Write one already-encoded frame, giving up after `timeout`.
    pub async fn send(&self, frame: &[u8], timeout: Duration) -> Result<(), BroadcastWriteError> {
        if self.is_broken() {
            return Err(BroadcastWriteError::PeerBroken);
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            // Re-check under the lock: another sender may have failed meanwhile.
            if self.is_broken() {
                return Err(BroadcastWriteError::PeerBroken);
            }
            writer.write_all(frame).await?;
            writer.flush().await?;
            Ok::<(), BroadcastWriteError>(())
        };

        let result = match tokio::time::timeout(timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(BroadcastWriteError::TimedOut(timeout)),
        };

        if let Err(BroadcastWriteError::Io(_) | BroadcastWriteError::TimedOut(_)) = &result {
            self.mark_broken(timeout).await;
        }
        result
    }

    async fn mark_broken(&self, timeout: Duration) {
        if self.broken.swap(true, Ordering::AcqRel) {
            return;
        }
        // Closing our side makes the client hang up, which ends this peer's handler.
        match tokio::time::timeout(timeout, self.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(connection = %self.id, error = %err, "Broken peer close failed"),
            Err(_) => debug!(connection = %self.id, "Broken peer close timed out"),
        }
    }

    /// Shut down the write half of the transport.
    pub async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("connected_at", &self.connected_at)
            .field("broken", &self.is_broken())
            .finish_non_exhaustive()
    }
}

/// Live set of open connections, in join order.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    peers: Arc<Mutex<Vec<Peer>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a peer to the live set.
    ///
    /// The returned guard removes the peer again when dropped. Joining an id
    /// that is already present leaves the existing entry in place.
    pub fn join(&self, peer: Peer) -> Registration {
        let id = peer.id();
        {
            let mut peers = self.lock();
            if !peers.iter().any(|p| p.id() == id) {
                peers.push(peer);
            }
        }
        Registration { registry: self.clone(), id }
    }

    /// Remove a peer. Returns false if it was not a member; that is not an error.
    pub fn leave(&self, id: ConnectionId) -> bool {
        let mut peers = self.lock();
        match peers.iter().position(|p| p.id() == id) {
            Some(index) => {
                peers.remove(index);
                true
            }
            None => false,
        }
    }

    /// All members except `sender`, in join order.
    pub fn snapshot_excluding(&self, sender: ConnectionId) -> Vec<Peer> {
        self.lock().iter().filter(|p| p.id() != sender).cloned().collect()
    }

    /// All members, in join order.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.lock().clone()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().iter().any(|p| p.id() == id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Membership held by a connection handler while it is `Open`.
#[must_use = "dropping the registration immediately removes the peer"]
#[derive(Debug)]
pub struct Registration {
    registry: ClientRegistry,
    id: ConnectionId,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.leave(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new(ConnectionId::new(), "127.0.0.1:9000".parse().unwrap(), tokio::io::sink())
    }

    #[test]
    fn test_join_and_snapshot_excluding() {
        let registry = ClientRegistry::new();
        let (a, b, c) = (peer(), peer(), peer());
        let (ida, idb, idc) = (a.id(), b.id(), c.id());

        let _ra = registry.join(a);
        let _rb = registry.join(b);
        let _rc = registry.join(c);

        assert_eq!(registry.len(), 3);
        let others: Vec<_> = registry.snapshot_excluding(ida).iter().map(Peer::id).collect();
        assert_eq!(others, vec![idb, idc]);

        let others: Vec<_> = registry.snapshot_excluding(idb).iter().map(Peer::id).collect();
        assert_eq!(others, vec![ida, idc]);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let registry = ClientRegistry::new();
        let a = peer();
        let b = peer();
        let ida = a.id();
        let idb = b.id();
        let ra = registry.join(a);
        let _rb = registry.join(b);

        assert!(registry.leave(ida));
        assert!(!registry.leave(ida));
        assert!(!registry.leave(ConnectionId::new()));
        assert!(registry.contains(idb));
        assert_eq!(registry.len(), 1);

        // The guard's own removal is now a no-op as well.
        drop(ra);
        assert!(registry.contains(idb));
    }

    #[test]
    fn test_registration_drop_removes_peer() {
        let registry = ClientRegistry::new();
        let a = peer();
        let id = a.id();
        {
            let registration = registry.join(a);
            assert_eq!(registration.id(), id);
            assert!(registry.contains(id));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_join_keeps_single_entry() {
        let registry = ClientRegistry::new();
        let a = peer();
        let _first = registry.join(a.clone());
        let _second = registry.join(a);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_join_leave() {
        let registry = ClientRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let p = peer();
                        let id = p.id();
                        let registration = registry.join(p);
                        let _ = registry.snapshot_excluding(id);
                        registry.leave(id);
                        drop(registration);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_peer_records_connect_time() {
        let before = Utc::now();
        let p = peer();
        assert!(p.connected_at() >= before);
        assert!(p.connected_at() <= Utc::now());
        assert!(!p.is_broken());
    }

    #[tokio::test]
    async fn test_peer_send_writes_frame() {
        let (client, mut server_side) = tokio::io::duplex(64);
        let p = Peer::new(ConnectionId::new(), "127.0.0.1:9000".parse().unwrap(), client);

        p.send(b"\x81\x02hi", Duration::from_secs(1)).await.unwrap();

        let mut buf = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut server_side, &mut buf).await.unwrap();
        assert_eq!(&buf, b"\x81\x02hi");
    }

    #[tokio::test]
    async fn test_peer_send_times_out_when_stalled() {
        // Nobody reads the other end, so the 8-byte pipe fills up.
        let (client, _server_side) = tokio::io::duplex(8);
        let p = Peer::new(ConnectionId::new(), "127.0.0.1:9000".parse().unwrap(), client);

        let result = p.send(&[0u8; 64], Duration::from_millis(50)).await;
        assert!(matches!(result, Err(BroadcastWriteError::TimedOut(_))));
        assert!(p.is_broken());
    }

    #[tokio::test]
    async fn test_no_frame_follows_a_truncated_write() {
        let (client, mut server_side) = tokio::io::duplex(16);
        let p = Peer::new(ConnectionId::new(), "127.0.0.1:9000".parse().unwrap(), client);

        let big = crate::frame::encode(&"A".repeat(100));
        let first = p.send(&big, Duration::from_millis(30)).await;
        assert!(matches!(first, Err(BroadcastWriteError::TimedOut(_))));

        let second = p.send(&crate::frame::encode("hello"), Duration::from_millis(30)).await;
        assert!(matches!(second, Err(BroadcastWriteError::PeerBroken)));

        // Only the truncated prefix of the first frame, then end of stream.
        let mut received = Vec::new();
        tokio::time::timeout(
            Duration::from_secs(1),
            tokio::io::AsyncReadExt::read_to_end(&mut server_side, &mut received),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(received, big[..16].to_vec());
    }

    #[tokio::test]
    async fn test_failed_write_marks_clones_broken() {
        let (client, server_side) = tokio::io::duplex(64);
        let p = Peer::new(ConnectionId::new(), "127.0.0.1:9000".parse().unwrap(), client);
        let registry = ClientRegistry::new();
        let _registration = registry.join(p.clone());
        drop(server_side);

        let result = p.send(b"\x81\x02hi", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(BroadcastWriteError::Io(_))));

        let snapshot = registry.snapshot();
        assert!(snapshot[0].is_broken());
        assert!(matches!(
            snapshot[0].send(b"\x81\x02hi", Duration::from_secs(1)).await,
            Err(BroadcastWriteError::PeerBroken)
        ));
    }
}
