//! Observability counters shared by the pipeline components

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated on the request path
#[derive(Debug, Default)]
pub struct SecurityStats {
    requests_validated: AtomicU64,
    rate_limit_denials: AtomicU64,
    soft_limit_events: AtomicU64,
    csrf_denials: AtomicU64,
    hsts_withheld: AtomicU64,
    sweeper_evictions: AtomicU64,
}

/// Point-in-time copy of [`SecurityStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests_validated: u64,
    pub rate_limit_denials: u64,
    pub soft_limit_events: u64,
    pub csrf_denials: u64,
    pub hsts_withheld: u64,
    pub sweeper_evictions: u64,
}

impl SecurityStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request(&self) {
        self.requests_validated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limit_denial(&self) {
        self.rate_limit_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_soft_limit(&self) {
        self.soft_limit_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_csrf_denial(&self) {
        self.csrf_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hsts_withheld(&self) {
        self.hsts_withheld.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: usize) {
        self.sweeper_evictions
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_validated: self.requests_validated.load(Ordering::Relaxed),
            rate_limit_denials: self.rate_limit_denials.load(Ordering::Relaxed),
            soft_limit_events: self.soft_limit_events.load(Ordering::Relaxed),
            csrf_denials: self.csrf_denials.load(Ordering::Relaxed),
            hsts_withheld: self.hsts_withheld.load(Ordering::Relaxed),
            sweeper_evictions: self.sweeper_evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_recorded_events() {
        let stats = SecurityStats::new();
        stats.record_request();
        stats.record_request();
        stats.record_soft_limit();
        stats.record_evictions(3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_validated, 2);
        assert_eq!(snapshot.soft_limit_events, 1);
        assert_eq!(snapshot.sweeper_evictions, 3);
        assert_eq!(snapshot.csrf_denials, 0);
    }
}
