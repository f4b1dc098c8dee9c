use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters shared by a proxy's workers.
#[derive(Default)]
pub struct ProxyStats {
    pub packets_diverted: AtomicU64,
    pub packets_rewritten: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub reinject_failures: AtomicU64,
    pub connections_accepted: AtomicU64,
    pub connections_unmatched: AtomicU64,
    pub connect_failures: AtomicU64,
    pub bytes_upstream: AtomicU64,
    pub bytes_downstream: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub packets_diverted: u64,
    pub packets_rewritten: u64,
    pub packets_dropped: u64,
    pub reinject_failures: u64,
    pub connections_accepted: u64,
    pub connections_unmatched: u64,
    pub connect_failures: u64,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
}

impl ProxyStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_diverted: self.packets_diverted.load(Ordering::Relaxed),
            packets_rewritten: self.packets_rewritten.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            reinject_failures: self.reinject_failures.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_unmatched: self.connections_unmatched.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
        }
    }

    fn counters(&self) -> [&AtomicU64; 9] {
        [
            &self.packets_diverted,
            &self.packets_rewritten,
            &self.packets_dropped,
            &self.reinject_failures,
            &self.connections_accepted,
            &self.connections_unmatched,
            &self.connect_failures,
            &self.bytes_upstream,
            &self.bytes_downstream,
        ]
    }
}
