//! Relaxed atomic counters shared by the stages; snapshotted once at
//! shutdown for the final report.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    /// Datagrams accepted off either socket.
    pub packets_in: AtomicU64,
    /// Datagrams sent on either socket.
    pub packets_out: AtomicU64,
    /// Valid client queries that entered processing.
    pub requests: AtomicU64,
    /// Replies delivered back to a client (upstream or cache).
    pub served: AtomicU64,
    /// Requests that timed out, actively or passively.
    pub time_outs: AtomicU64,

    // Drop reasons
    pub dropped_malformed: AtomicU64,
    pub dropped_unexpected_qr: AtomicU64,
    pub dropped_foreign: AtomicU64,
    pub dropped_oversize: AtomicU64,
    pub dropped_no_id: AtomicU64,
    pub dropped_send_failed: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let served = self.served.load(Ordering::Relaxed);
        let time_outs = self.time_outs.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            requests,
            served,
            time_outs,
            // Whatever was neither answered nor timed out yet
            processing: requests.saturating_sub(served + time_outs),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_unexpected_qr: self.dropped_unexpected_qr.load(Ordering::Relaxed),
            dropped_foreign: self.dropped_foreign.load(Ordering::Relaxed),
            dropped_oversize: self.dropped_oversize.load(Ordering::Relaxed),
            dropped_no_id: self.dropped_no_id.load(Ordering::Relaxed),
            dropped_send_failed: self.dropped_send_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_in: u64,
    pub packets_out: u64,
    pub requests: u64,
    pub served: u64,
    pub time_outs: u64,
    pub processing: u64,
    pub dropped_malformed: u64,
    pub dropped_unexpected_qr: u64,
    pub dropped_foreign: u64,
    pub dropped_oversize: u64,
    pub dropped_no_id: u64,
    pub dropped_send_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counts() {
        let stats = Stats::new();
        Stats::inc(&stats.packets_in);
        Stats::inc(&stats.packets_in);
        Stats::inc(&stats.requests);
        Stats::inc(&stats.served);
        Stats::add(&stats.time_outs, 3);

        let snap = stats.snapshot();
        assert_eq!(snap.packets_in, 2);
        assert_eq!(snap.requests, 1);
        assert_eq!(snap.served, 1);
        assert_eq!(snap.time_outs, 3);
    }

    #[test]
    fn processing_never_underflows() {
        let stats = Stats::new();
        Stats::inc(&stats.requests);
        Stats::add(&stats.served, 1);
        Stats::add(&stats.time_outs, 5);
        assert_eq!(stats.snapshot().processing, 0);
    }

    #[test]
    fn processing_counts_outstanding_requests() {
        let stats = Stats::new();
        Stats::add(&stats.requests, 10);
        Stats::add(&stats.served, 6);
        Stats::add(&stats.time_outs, 1);
        assert_eq!(stats.snapshot().processing, 3);
    }
}
