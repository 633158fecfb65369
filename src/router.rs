//! Repository routing over a live connection set.
//!
//! [`ShardRouter`] owns the current [`ConnectionSet`] and keeps it in step
//! with configuration. Readers load the set without locking and use that
//! one snapshot for the whole call, so they never pair an address table
//! with another table's connections. Reconciliation builds the next set
//! completely, publishes it, and only then closes connections the new set
//! no longer holds.

use std::sync::{Arc, Once};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::admission::AdmissionController;
use crate::config::ConfigSource;
use crate::conns::{AddressWithConn, ConnectionSet};
use crate::dial::Dial;
use crate::error::{Error, Result};
use crate::metrics::{MetricsSnapshot, RouterMetrics};
use crate::placement::AddressTable;

/// Routes repositories to shard connections.
///
/// Construct one per process and share it by cloning; clones are cheap
/// handles to the same state. The router subscribes to its configuration
/// source on first use, not on construction, so it may be built before
/// configuration is ready.
pub struct ShardRouter<D: Dial> {
    inner: Arc<Inner<D>>,
}

impl<D: Dial> Clone for ShardRouter<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<D: Dial> {
    source: Arc<dyn ConfigSource>,
    dialer: D,
    admission: Arc<AdmissionController>,
    current: ArcSwapOption<ConnectionSet<D::Conn>>,
    subscribe: Once,
    reconciling: Mutex<()>,
    metrics: RouterMetrics,
}

impl<D: Dial> ShardRouter<D> {
    pub fn new(source: Arc<dyn ConfigSource>, dialer: D, admission: Arc<AdmissionController>) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                dialer,
                admission,
                current: ArcSwapOption::empty(),
                subscribe: Once::new(),
                reconciling: Mutex::new(()),
                metrics: RouterMetrics::default(),
            }),
        }
    }

    /// Address of the shard that owns `repo`.
    pub fn addr_for_repo(&self, repo: &str) -> Result<String> {
        let set = self.snapshot()?;
        self.inner.metrics.record_placement();
        set.addr_for_repo(repo)
    }

    /// Connection to the shard that owns `repo`. If that shard failed to
    /// dial, its error is returned until the address list changes.
    pub fn conn_for_repo(&self, repo: &str) -> Result<D::Conn> {
        let set = self.snapshot()?;
        self.inner.metrics.record_placement();
        set.conn_for_repo(repo)
    }

    /// Every shard in configured order, with its connection or dial error.
    pub fn addresses(&self) -> Vec<AddressWithConn<D::Conn>> {
        self.snapshot()
            .map(|set| set.addresses())
            .unwrap_or_default()
    }

    pub fn get_address_with_conn(&self, address: &str) -> Option<AddressWithConn<D::Conn>> {
        self.snapshot().ok()?.get_address_with_conn(address)
    }

    /// The currently published set.
    pub fn snapshot(&self) -> Result<Arc<ConnectionSet<D::Conn>>> {
        self.ensure_subscribed();
        self.inner.current.load_full().ok_or(Error::NoAddresses)
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.inner.admission
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner
            .metrics
            .snapshot(self.inner.admission.in_flight())
    }

    /// Re-reads configuration and publishes a new set. The subscription
    /// calls this on every change; calling it directly forces a refresh.
    pub fn reconcile(&self) {
        self.ensure_subscribed();
        self.inner.reconcile();
    }

    fn ensure_subscribed(&self) {
        self.inner.subscribe.call_once(|| {
            let weak = Arc::downgrade(&self.inner);
            self.inner.source.watch(Box::new(move || match weak.upgrade() {
                Some(inner) => {
                    inner.reconcile();
                    true
                }
                None => false,
            }));
            // Sources are expected to notify on registration; cover those that don't.
            if self.inner.current.load().is_none() {
                self.inner.reconcile();
            }
        });
    }
}

impl<D: Dial> Inner<D> {
    #[instrument(level = "debug", skip_all)]
    fn reconcile(&self) {
        // Forced refreshes may race the subscription.
        let _reconciling = self.reconciling.lock();
        let table = AddressTable::new(self.source.addresses(), self.source.pinned());
        if table.is_empty() {
            warn!("gitserver address list is empty; repositories cannot be placed");
        }

        let previous = self.current.load_full();
        let rebuilt = previous
            .as_deref()
            .map_or(true, |prev| !prev.table().same_addresses(&table));

        let next = Arc::new(ConnectionSet::build(
            table,
            previous.as_deref(),
            &self.dialer,
            &self.admission,
        ));
        self.metrics.record_reconciliation(rebuilt);
        if rebuilt {
            let failures = next.failures();
            self.metrics.record_dial_failures(failures as u64);
            info!(
                addresses = next.table().addresses().len(),
                failures, "rebuilt gitserver connection set"
            );
        } else {
            debug!(
                pinned = next.table().pinned().len(),
                "gitserver addresses unchanged; reusing connections"
            );
        }

        self.current.store(Some(Arc::clone(&next)));

        // Only after publishing: nobody can load a set holding these anymore.
        let Some(previous) = previous else {
            return;
        };
        for outcome in ConnectionSet::stale_outcomes(&previous, &next) {
            if let Some(conn) = outcome.take_for_close() {
                self.dialer.close(outcome.address(), conn);
                self.metrics.record_close();
            }
        }
    }
}
