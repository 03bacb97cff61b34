//! Transport Metrics
//!
//! Lock-free counters updated from transfer tasks and read by monitoring.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Transfer counters
#[derive(Debug, Default)]
pub struct TransportMetrics {
    pub transfers_started: AtomicU64,
    pub transfers_completed: AtomicU64,
    pub transfers_failed: AtomicU64,
    pub transfers_rejected: AtomicU64,
    pub bytes_transferred: AtomicU64,
    pub latency_total_ns: AtomicU64,
    pub memory_registered: AtomicU64,
    pub memory_unregistered: AtomicU64,
}

impl TransportMetrics {
    pub fn record_started(&self) {
        self.transfers_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, bytes: usize, latency: Duration) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.latency_total_ns
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.transfers_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registered(&self) {
        self.memory_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unregistered(&self) {
        self.memory_unregistered.fetch_add(1, Ordering::Relaxed);
    }

    /// Average latency of completed transfers
    pub fn avg_latency_ns(&self) -> f64 {
        let completed = self.transfers_completed.load(Ordering::Relaxed);
        if completed == 0 {
            return 0.0;
        }
        self.latency_total_ns.load(Ordering::Relaxed) as f64 / completed as f64
    }

    /// Transfers accepted but not yet finished
    pub fn in_flight(&self) -> u64 {
        let started = self.transfers_started.load(Ordering::Relaxed);
        let finished = self.transfers_completed.load(Ordering::Relaxed)
            + self.transfers_failed.load(Ordering::Relaxed);
        started.saturating_sub(finished)
    }

    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            transfers_started: self.transfers_started.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            transfers_rejected: self.transfers_rejected.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            avg_latency_ns: self.avg_latency_ns(),
            registered_regions: self
                .memory_registered
                .load(Ordering::Relaxed)
                .saturating_sub(self.memory_unregistered.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of `TransportMetrics`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportStats {
    pub transfers_started: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub transfers_rejected: u64,
    pub bytes_transferred: u64,
    pub avg_latency_ns: f64,
    pub registered_regions: u64,
}
