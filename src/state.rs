//! # Server State
//!
//! Everything a connection handler needs from the server, bundled into one cheap
//! `Clone`: configuration, the client registry, counters and the start time.
//! There is no global state; each [`crate::server::Server`] owns one `ServerState`
//! and hands clones to its handlers.
//!
//! ## Metrics:
//! Counters are plain atomics. They are only ever incremented, so `Relaxed`
//! ordering is enough; a snapshot may be a few events behind a concurrent writer.

use crate::config::AppConfig;
use crate::registry::ClientRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared state handed to every connection handler.
#[derive(Debug, Clone)]
pub struct ServerState {
    pub config: Arc<AppConfig>,
    pub registry: ClientRegistry,
    pub metrics: Arc<ServerMetrics>,
    pub start_time: Instant,
}

impl ServerState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: ClientRegistry::new(),
            metrics: Arc::new(ServerMetrics::default()),
            start_time: Instant::now(),
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.config.limits.write_timeout_ms)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Lifetime counters for one server.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    handshakes_failed: AtomicU64,
    messages_received: AtomicU64,
    frames_delivered: AtomicU64,
    write_failures: AtomicU64,
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub handshakes_failed: u64,
    pub messages_received: u64,
    pub frames_delivered: u64,
    pub write_failures: u64,
}

impl ServerMetrics {
    pub fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one fan-out.
    pub fn record_broadcast(&self, delivered: usize, failed: usize) {
        self.frames_delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        self.write_failures.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot() {
        let metrics = ServerMetrics::default();
        metrics.record_accepted();
        metrics.record_accepted();
        metrics.record_rejected();
        metrics.record_handshake_failed();
        metrics.record_message();
        metrics.record_broadcast(3, 1);

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                connections_accepted: 2,
                connections_rejected: 1,
                handshakes_failed: 1,
                messages_received: 1,
                frames_delivered: 3,
                write_failures: 1,
            }
        );
    }

    #[test]
    fn test_state_clones_share_registry_and_metrics() {
        let state = ServerState::new(AppConfig::default());
        let clone = state.clone();
        clone.metrics.record_message();
        assert_eq!(state.metrics.snapshot().messages_received, 1);
        assert_eq!(state.write_timeout(), Duration::from_millis(5000));
    }
}
