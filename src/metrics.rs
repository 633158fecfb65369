//! Router counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RouterMetrics {
    addr_for_repo_invoked: AtomicU64,
    reconciliations: AtomicU64,
    rebuilds: AtomicU64,
    dial_failures: AtomicU64,
    closed_connections: AtomicU64,
}

impl RouterMetrics {
    pub(crate) fn record_placement(&self) {
        self.addr_for_repo_invoked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconciliation(&self, rebuilt: bool) {
        self.reconciliations.fetch_add(1, Ordering::Relaxed);
        if rebuilt {
            self.rebuilds.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_dial_failures(&self, count: u64) {
        self.dial_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_close(&self) {
        self.closed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, in_flight: i64) -> MetricsSnapshot {
        MetricsSnapshot {
            addr_for_repo_invoked: self.addr_for_repo_invoked.load(Ordering::Relaxed),
            reconciliations: self.reconciliations.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            closed_connections: self.closed_connections.load(Ordering::Relaxed),
            in_flight,
        }
    }
}

/// Point-in-time copy of the router counters and the admission gauge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Placement lookups, one per `addr_for_repo` or `conn_for_repo`
    pub addr_for_repo_invoked: u64,
    /// Configuration notifications handled
    pub reconciliations: u64,
    /// Reconciliations that redialed the whole set
    pub rebuilds: u64,
    /// Addresses whose dial failed
    pub dial_failures: u64,
    /// Stale connections closed after a rebuild
    pub closed_connections: u64,
    /// Calls currently holding an admission slot
    pub in_flight: i64,
}
