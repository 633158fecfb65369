//! Immutable connection sets.
//!
//! A [`ConnectionSet`] pairs an [`AddressTable`] with one [`DialOutcome`]
//! per distinct address. Sets are never mutated after construction; the
//! router publishes a new one on every configuration change.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::admission::AdmissionController;
use crate::dial::{Dial, DialError};
use crate::error::{Error, Result};
use crate::placement::{self, AddressTable};

/// The result of dialing one address: a connection or the error that
/// prevented it.
#[derive(Debug)]
pub struct DialOutcome<C> {
    address: String,
    conn: Option<C>,
    error: Option<DialError>,
    closed: AtomicBool,
}

impl<C: Clone> DialOutcome<C> {
    pub fn connected(address: impl Into<String>, conn: C) -> Self {
        Self {
            address: address.into(),
            conn: Some(conn),
            error: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn failed(address: impl Into<String>, error: DialError) -> Self {
        Self {
            address: address.into(),
            conn: None,
            error: Some(error),
            closed: AtomicBool::new(false),
        }
    }

    fn dial<D: Dial<Conn = C>>(
        address: &str,
        dialer: &D,
        admission: &Arc<AdmissionController>,
    ) -> Self {
        match dialer.dial(address, admission) {
            Ok(conn) => Self::connected(address, conn),
            Err(err) => {
                tracing::warn!(address, error = %err, "failed to dial gitserver");
                Self::failed(address, err)
            }
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn conn(&self) -> Option<&C> {
        self.conn.as_ref()
    }

    pub fn error(&self) -> Option<&DialError> {
        self.error.as_ref()
    }

    /// The connection, or the captured dial error.
    pub fn result(&self) -> Result<C> {
        match (&self.conn, &self.error) {
            (_, Some(err)) => Err(err.clone().into()),
            (Some(conn), None) => Ok(conn.clone()),
            (None, None) => Err(Error::NoConnection {
                address: self.address.clone(),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hands out the connection for closing. Returns `None` if there is no
    /// connection or it was already handed out.
    pub(crate) fn take_for_close(&self) -> Option<C> {
        let conn = self.conn.as_ref()?;
        if self.closed.swap(true, Ordering::AcqRel) {
            tracing::warn!(address = %self.address, "gitserver connection already closed");
            return None;
        }
        Some(conn.clone())
    }
}

/// One entry of a connection-set enumeration.
#[derive(Debug, Clone)]
pub struct AddressWithConn<C> {
    pub address: String,
    pub conn: Option<C>,
    pub error: Option<DialError>,
}

impl<C> AddressWithConn<C> {
    pub fn into_result(self) -> Result<C> {
        match (self.conn, self.error) {
            (_, Some(err)) => Err(err.into()),
            (Some(conn), None) => Ok(conn),
            (None, None) => Err(Error::NoConnection {
                address: self.address,
            }),
        }
    }
}

/// An address table with its dialed connections.
#[derive(Debug)]
pub struct ConnectionSet<C> {
    table: AddressTable,
    outcomes: HashMap<String, Arc<DialOutcome<C>>>,
}

impl<C: Clone> ConnectionSet<C> {
    /// Builds the set for `table`. When `previous` lists the same addresses
    /// in the same order its outcomes are shared and nothing is dialed;
    /// otherwise every address is dialed fresh.
    pub fn build<D: Dial<Conn = C>>(
        table: AddressTable,
        previous: Option<&ConnectionSet<C>>,
        dialer: &D,
        admission: &Arc<AdmissionController>,
    ) -> Self {
        match previous {
            Some(previous) if previous.table.same_addresses(&table) => previous.with_table(table),
            _ => Self::dial(table, dialer, admission),
        }
    }

    /// Dials every distinct address in `table`. A failed dial is recorded
    /// for its address and does not stop the others.
    pub fn dial<D: Dial<Conn = C>>(
        table: AddressTable,
        dialer: &D,
        admission: &Arc<AdmissionController>,
    ) -> Self {
        let mut outcomes = HashMap::with_capacity(table.addresses().len());
        for address in table.addresses() {
            if outcomes.contains_key(address) {
                continue;
            }
            let outcome = DialOutcome::dial(address, dialer, admission);
            outcomes.insert(address.clone(), Arc::new(outcome));
        }
        Self { table, outcomes }
    }

    /// A set for `table` that shares this set's outcomes.
    pub fn with_table(&self, table: AddressTable) -> Self {
        Self {
            table,
            outcomes: self.outcomes.clone(),
        }
    }

    /// Outcomes of `previous` that `next` does not share. These are the
    /// connections to close once `next` is published.
    pub fn stale_outcomes(
        previous: &ConnectionSet<C>,
        next: &ConnectionSet<C>,
    ) -> Vec<Arc<DialOutcome<C>>> {
        previous
            .outcomes
            .iter()
            .filter(|(address, outcome)| {
                next.outcomes
                    .get(*address)
                    .map_or(true, |kept| !Arc::ptr_eq(kept, outcome))
            })
            .map(|(_, outcome)| Arc::clone(outcome))
            .collect()
    }

    pub fn table(&self) -> &AddressTable {
        &self.table
    }

    pub fn outcome(&self, address: &str) -> Option<&Arc<DialOutcome<C>>> {
        self.outcomes.get(address)
    }

    /// Number of dial failures recorded in this set.
    pub fn failures(&self) -> usize {
        self.outcomes
            .values()
            .filter(|outcome| outcome.error.is_some())
            .count()
    }

    /// True when the outcome keys are exactly the table's addresses.
    pub fn is_consistent(&self) -> bool {
        let expected: HashSet<&str> = self.table.addresses().iter().map(String::as_str).collect();
        self.outcomes.len() == expected.len()
            && expected
                .iter()
                .all(|address| self.outcomes.contains_key(*address))
    }

    pub fn addr_for_repo(&self, repo: &str) -> Result<String> {
        placement::addr_for_repo(repo, &self.table)
    }

    /// Connection for the shard owning `repo`, or that shard's dial error.
    pub fn conn_for_repo(&self, repo: &str) -> Result<C> {
        let address = self.addr_for_repo(repo)?;
        self.conn_for_address(&address)
    }

    pub fn conn_for_address(&self, address: &str) -> Result<C> {
        match self.outcomes.get(address) {
            Some(outcome) => outcome.result(),
            None => Err(Error::NoConnection {
                address: address.to_string(),
            }),
        }
    }

    pub fn get_address_with_conn(&self, address: &str) -> Option<AddressWithConn<C>> {
        self.outcomes.get(address).map(|outcome| AddressWithConn {
            address: outcome.address.clone(),
            conn: outcome.conn.clone(),
            error: outcome.error.clone(),
        })
    }

    /// Every address in table order, with its outcome.
    pub fn addresses(&self) -> Vec<AddressWithConn<C>> {
        let mut seen = HashSet::new();
        self.table
            .addresses()
            .iter()
            .filter(|address| seen.insert(address.as_str()))
            .filter_map(|address| self.get_address_with_conn(address))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingDialer {
        dials: AtomicUsize,
        refuse: Mutex<Vec<String>>,
    }

    impl Dial for CountingDialer {
        type Conn = (String, usize);

        fn dial(
            &self,
            address: &str,
            _admission: &Arc<AdmissionController>,
        ) -> std::result::Result<Self::Conn, DialError> {
            let generation = self.dials.fetch_add(1, Ordering::SeqCst);
            if self.refuse.lock().iter().any(|a| a == address) {
                return Err(DialError::Transport {
                    address: address.to_string(),
                    message: "connection refused".to_string(),
                });
            }
            Ok((address.to_string(), generation))
        }

        fn close(&self, _address: &str, _conn: Self::Conn) {}
    }

    fn table(addrs: &[&str], pinned: &[(&str, &str)]) -> AddressTable {
        AddressTable::new(
            addrs.iter().map(|a| a.to_string()).collect(),
            pinned
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn admission() -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(8))
    }

    #[test]
    fn pin_change_reuses_outcomes() {
        let dialer = CountingDialer::default();
        let admission = admission();
        let first = ConnectionSet::build(table(&["a", "b"], &[]), None, &dialer, &admission);
        let second = ConnectionSet::build(
            table(&["a", "b"], &[("repo", "b")]),
            Some(&first),
            &dialer,
            &admission,
        );
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(
            first.outcome("a").unwrap(),
            second.outcome("a").unwrap()
        ));
        assert!(ConnectionSet::stale_outcomes(&first, &second).is_empty());
        assert_eq!(second.addr_for_repo("repo").unwrap(), "b");
    }

    #[test]
    fn address_change_redials_everything() {
        let dialer = CountingDialer::default();
        let admission = admission();
        let first = ConnectionSet::build(table(&["a", "b"], &[]), None, &dialer, &admission);
        let second = ConnectionSet::build(table(&["a", "c"], &[]), Some(&first), &dialer, &admission);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 4);

        let stale = ConnectionSet::stale_outcomes(&first, &second);
        let mut stale_addrs: Vec<_> = stale.iter().map(|o| o.address().to_string()).collect();
        stale_addrs.sort();
        assert_eq!(stale_addrs, vec!["a", "b"]);
        assert!(second.is_consistent());
    }

    #[test]
    fn dial_failure_is_recorded_per_address() {
        let dialer = CountingDialer::default();
        dialer.refuse.lock().push("b".to_string());
        let set = ConnectionSet::dial(table(&["a", "b", "c"], &[]), &dialer, &admission());

        assert_eq!(set.failures(), 1);
        assert!(set.conn_for_address("a").is_ok());
        assert!(set.conn_for_address("c").is_ok());
        let err = set.conn_for_address("b").unwrap_err();
        assert!(matches!(err, Error::Dial(DialError::Transport { .. })));
        assert!(set.is_consistent());
    }

    #[test]
    fn unknown_address_is_a_lookup_error() {
        let dialer = CountingDialer::default();
        let set = ConnectionSet::dial(table(&["a"], &[("repo", "elsewhere")]), &dialer, &admission());
        assert!(matches!(
            set.conn_for_repo("repo"),
            Err(Error::NoConnection { address }) if address == "elsewhere"
        ));
        assert!(set.get_address_with_conn("elsewhere").is_none());
    }

    #[test]
    fn duplicate_addresses_dial_once() {
        let dialer = CountingDialer::default();
        let set = ConnectionSet::dial(table(&["a", "a", "b"], &[]), &dialer, &admission());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert!(set.is_consistent());
        let listed: Vec<_> = set.addresses().into_iter().map(|e| e.address).collect();
        assert_eq!(listed, vec!["a", "b"]);
    }

    #[test]
    fn outcomes_close_once() {
        let outcome = DialOutcome::connected("a", 1u8);
        assert_eq!(outcome.take_for_close(), Some(1));
        assert_eq!(outcome.take_for_close(), None);
        assert!(outcome.is_closed());

        let failed: DialOutcome<u8> = DialOutcome::failed(
            "b",
            DialError::Transport {
                address: "b".to_string(),
                message: "refused".to_string(),
            },
        );
        assert_eq!(failed.take_for_close(), None);
    }
}
