use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Snapshot of tunnel traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    /// Total number of relayed connections
    pub total_connections: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Bytes forwarded from side A to side B (client to peer)
    pub bytes_up: u64,
    /// Bytes forwarded from side B to side A (peer to client)
    pub bytes_down: u64,
    /// Timestamp when the tracker was created (Unix timestamp)
    pub start_time: u64,
}

/// Traffic statistics shared by an orchestrator and its relays
#[derive(Debug, Clone)]
pub struct TrafficStats {
    total_connections: Arc<AtomicU64>,
    active_connections: Arc<AtomicU64>,
    bytes_up: Arc<AtomicU64>,
    bytes_down: Arc<AtomicU64>,
    start_time: u64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self {
            total_connections: Arc::new(AtomicU64::new(0)),
            active_connections: Arc::new(AtomicU64::new(0)),
            bytes_up: Arc::new(AtomicU64::new(0)),
            bytes_down: Arc::new(AtomicU64::new(0)),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Increment active connections (called when a relay starts)
    pub fn connection_started(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections (called when a relay ends)
    pub fn connection_ended(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get current snapshot of stats
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard: counts a connection as active until dropped
pub struct ConnectionGuard {
    stats: TrafficStats,
}

impl ConnectionGuard {
    pub fn new(stats: TrafficStats) -> Self {
        stats.connection_started();
        Self { stats }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connection_ended();
    }
}
