use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gitshard::{AdmissionController, ConfigSource, Dial, DialError, MemoryConfigSource, ShardRouter};
use parking_lot::Mutex;

/// Address plus the dial generation that produced it.
pub type TestConn = (String, u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Dial(String),
    Close(String, u64),
}

type CloseHook = Box<dyn Fn(&str, &TestConn) + Send + Sync>;

/// Dialer that records every dial and close and refuses chosen addresses.
#[derive(Clone, Default)]
pub struct RecordingDialer {
    state: Arc<State>,
}

#[derive(Default)]
struct State {
    generation: AtomicU64,
    events: Mutex<Vec<Event>>,
    refused: Mutex<HashSet<String>>,
    on_close: Mutex<Option<CloseHook>>,
}

#[allow(dead_code)]
impl RecordingDialer {
    pub fn refuse(&self, address: &str) {
        self.state.refused.lock().insert(address.to_string());
    }

    pub fn allow(&self, address: &str) {
        self.state.refused.lock().remove(address);
    }

    /// Runs `hook` for every close, before the close is recorded.
    pub fn on_close(&self, hook: impl Fn(&str, &TestConn) + Send + Sync + 'static) {
        *self.state.on_close.lock() = Some(Box::new(hook));
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.events.lock().clone()
    }

    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.state.events.lock())
    }

    pub fn dialed(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Dial(address) => Some(address),
                Event::Close(..) => None,
            })
            .collect()
    }

    pub fn closed(&self) -> Vec<String> {
        let mut closed: Vec<_> = self
            .events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Close(address, _) => Some(address),
                Event::Dial(_) => None,
            })
            .collect();
        closed.sort();
        closed
    }
}

impl Dial for RecordingDialer {
    type Conn = TestConn;

    fn dial(
        &self,
        address: &str,
        _admission: &Arc<AdmissionController>,
    ) -> Result<TestConn, DialError> {
        self.state.events.lock().push(Event::Dial(address.to_string()));
        if self.state.refused.lock().contains(address) {
            return Err(DialError::Transport {
                address: address.to_string(),
                message: "connection refused".to_string(),
            });
        }
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst);
        Ok((address.to_string(), generation))
    }

    fn close(&self, address: &str, conn: TestConn) {
        if let Some(hook) = self.state.on_close.lock().as_ref() {
            hook(address, &conn);
        }
        self.state
            .events
            .lock()
            .push(Event::Close(address.to_string(), conn.1));
    }
}

#[allow(dead_code)]
pub fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[allow(dead_code)]
pub fn pins(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(repo, address)| (repo.to_string(), address.to_string()))
        .collect()
}

#[allow(dead_code)]
pub fn test_router(
    addresses: &[&str],
    pinned: &[(&str, &str)],
) -> (Arc<MemoryConfigSource>, RecordingDialer, ShardRouter<RecordingDialer>) {
    let source = Arc::new(MemoryConfigSource::new(strings(addresses), pins(pinned)));
    let dialer = RecordingDialer::default();
    let router = ShardRouter::new(
        Arc::clone(&source) as Arc<dyn ConfigSource>,
        dialer.clone(),
        Arc::new(AdmissionController::new(8)),
    );
    (source, dialer, router)
}
