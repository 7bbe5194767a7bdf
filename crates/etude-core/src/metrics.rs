// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Dispatcher counters. Only the dispatch thread writes them; anyone holding
/// the `Arc` may read a snapshot.
#[repr(C, align(64))]
pub struct Stats {
    pub active_conns: AtomicUsize,
    pub accepted: AtomicUsize,
    pub served: AtomicUsize,
    pub rejected: AtomicUsize,
    pub refused: AtomicUsize,
    pub pruned: AtomicUsize,
    pub bytes_sent: AtomicUsize,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub active_conns: usize,
    pub accepted: usize,
    /// Responses fully written.
    pub served: usize,
    /// Connections closed because the work queue was full.
    pub rejected: usize,
    /// Connections turned away at the connection limit.
    pub refused: usize,
    /// Idle connections closed by the timeout sweep.
    pub pruned: usize,
    pub bytes_sent: usize,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            served: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            refused: AtomicUsize::new(0),
            pruned: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_served(&self, bytes: usize) {
        self.served.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pruned(&self) {
        self.pruned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_conns: self.active_conns.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            served: self.served.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Stats::new();
        stats.inc_conn();
        stats.inc_conn();
        stats.dec_conn();
        stats.inc_served(120);
        stats.inc_rejected();
        let snap = stats.snapshot();
        assert_eq!(snap.active_conns, 1);
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.served, 1);
        assert_eq!(snap.bytes_sent, 120);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.pruned, 0);
    }
}
