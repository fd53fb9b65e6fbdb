//! Statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Thread-safe proxy counters.
///
/// Shared behind `Arc` by every connection task; all updates are
/// lock-free and may be observed in any interleaving.
pub struct Stats {
    all_connections: AtomicU64,
    active_connections: AtomicU64,
    incoming_traffic: AtomicU64,
    outgoing_traffic: AtomicU64,
    crashes: AtomicU64,
    start_time: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            all_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            incoming_traffic: AtomicU64::new(0),
            outgoing_traffic: AtomicU64::new(0),
            crashes: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn new_connection(&self) {
        self.all_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn close_connection(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_incoming_traffic(&self, bytes: u64) {
        self.incoming_traffic.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_outgoing_traffic(&self, bytes: u64) {
        self.outgoing_traffic.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A connection task panicked and was recovered by its supervisor.
    pub fn crash(&self) {
        self.crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn all_connections(&self) -> u64 {
        self.all_connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn incoming_traffic(&self) -> u64 {
        self.incoming_traffic.load(Ordering::Relaxed)
    }

    pub fn outgoing_traffic(&self) -> u64 {
        self.outgoing_traffic.load(Ordering::Relaxed)
    }

    pub fn crashes(&self) -> u64 {
        self.crashes.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
