//! Actor Metrics
//!
//! Each actor owns an `Arc<ActorMetrics>`; the actor thread updates it and
//! the system reads snapshots for the final `GraphReport`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub messages_processed: AtomicU64,
    pub processing_time_ns: AtomicU64,
    pub fires: AtomicU64,
    /// Fire attempts blocked on an exhausted output pool
    pub stalls: AtomicU64,
    pub registers_produced: AtomicU64,
    pub registers_returned: AtomicU64,
    pub transfers_issued: AtomicU64,
    pub transfers_completed: AtomicU64,
    pub transfers_failed: AtomicU64,
}

impl ActorMetrics {
    pub fn record_message(&self, elapsed: Duration) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.processing_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_fire(&self) {
        self.fires.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_produced(&self, count: u64) {
        self.registers_produced.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_returned(&self) {
        self.registers_returned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transfer_issued(&self) {
        self.transfers_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transfer_completed(&self) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transfer_failed(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_processing_time_ns(&self) -> f64 {
        let messages = self.messages_processed.load(Ordering::Relaxed);
        if messages == 0 {
            return 0.0;
        }
        self.processing_time_ns.load(Ordering::Relaxed) as f64 / messages as f64
    }

    pub fn snapshot(&self) -> ActorStats {
        ActorStats {
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            avg_processing_time_ns: self.avg_processing_time_ns(),
            fires: self.fires.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            registers_produced: self.registers_produced.load(Ordering::Relaxed),
            registers_returned: self.registers_returned.load(Ordering::Relaxed),
            transfers_issued: self.transfers_issued.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `ActorMetrics`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActorStats {
    pub messages_processed: u64,
    pub avg_processing_time_ns: f64,
    pub fires: u64,
    pub stalls: u64,
    pub registers_produced: u64,
    pub registers_returned: u64,
    pub transfers_issued: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
}
