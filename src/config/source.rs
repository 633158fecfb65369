//! Configuration sources the router subscribes to.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{normalize_addresses, ConfigError, GitShardConfig, ShardsConfig};

/// Callback invoked when configuration may have changed. Returning `false`
/// unsubscribes it.
pub type WatchCallback = Box<dyn Fn() -> bool + Send + Sync + 'static>;

/// Supplies shard addresses and pins, and notifies on change.
pub trait ConfigSource: Send + Sync + 'static {
    /// Ordered shard addresses.
    fn addresses(&self) -> Vec<String>;

    /// Repository name to address overrides.
    fn pinned(&self) -> HashMap<String, String>;

    /// Registers `callback`. It runs once before `watch` returns and again
    /// after every change, until it returns `false`. Notifications are
    /// delivered one at a time.
    fn watch(&self, callback: WatchCallback);
}

/// In-process source. Updates notify subscribers synchronously.
///
/// Callbacks must not update the source they are subscribed to.
#[derive(Default)]
pub struct MemoryConfigSource {
    state: RwLock<ShardsConfig>,
    subscribers: Mutex<Vec<Arc<dyn Fn() -> bool + Send + Sync>>>,
    delivering: Mutex<()>,
}

impl MemoryConfigSource {
    pub fn new(addresses: Vec<String>, pinned: HashMap<String, String>) -> Self {
        Self {
            state: RwLock::new(ShardsConfig { addresses, pinned }),
            ..Self::default()
        }
    }

    pub fn from_config(config: &GitShardConfig) -> Self {
        Self::new(config.addresses(), config.shards.pinned.clone())
    }

    pub fn set_addresses(&self, addresses: Vec<String>) {
        self.state.write().addresses = addresses;
        self.notify();
    }

    pub fn set_pinned(&self, pinned: HashMap<String, String>) {
        self.state.write().pinned = pinned;
        self.notify();
    }

    /// Replaces both inputs at once, with a single notification.
    pub fn update(&self, addresses: Vec<String>, pinned: HashMap<String, String>) {
        *self.state.write() = ShardsConfig { addresses, pinned };
        self.notify();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn notify(&self) {
        let _delivering = self.delivering.lock();
        let subscribers = self.subscribers.lock().clone();
        debug!(subscribers = subscribers.len(), "notifying config subscribers");
        let finished: Vec<_> = subscribers
            .into_iter()
            .filter(|callback| !callback())
            .collect();
        if !finished.is_empty() {
            self.subscribers
                .lock()
                .retain(|callback| !finished.iter().any(|done| Arc::ptr_eq(done, callback)));
        }
    }
}

impl ConfigSource for MemoryConfigSource {
    fn addresses(&self) -> Vec<String> {
        self.state.read().addresses.clone()
    }

    fn pinned(&self) -> HashMap<String, String> {
        self.state.read().pinned.clone()
    }

    fn watch(&self, callback: WatchCallback) {
        let callback: Arc<dyn Fn() -> bool + Send + Sync> = Arc::from(callback);
        let _delivering = self.delivering.lock();
        if callback() {
            self.subscribers.lock().push(callback);
        }
    }
}

/// TOML file (plus `GITSHARD_` environment) reloaded on demand or on a timer.
///
/// Every reload notifies subscribers, whether or not anything changed.
pub struct FileConfigSource {
    path: PathBuf,
    config: RwLock<GitShardConfig>,
    memory: MemoryConfigSource,
}

impl FileConfigSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = GitShardConfig::from_env(Some(&path))?;
        let memory = MemoryConfigSource::from_config(&config);
        Ok(Self {
            path,
            config: RwLock::new(config),
            memory,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The most recently loaded configuration.
    pub fn config(&self) -> GitShardConfig {
        self.config.read().clone()
    }

    /// Re-reads the file. On error the previous values stay in effect and
    /// no notification is sent.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let config = GitShardConfig::from_env(Some(&self.path))?;
        let addresses = normalize_addresses(&config.shards.addresses);
        let pinned = config.shards.pinned.clone();
        *self.config.write() = config;
        self.memory.update(addresses, pinned);
        Ok(())
    }

    /// Reloads every `interval` until the returned task is aborted.
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let source = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately and the file was just loaded.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = source.reload() {
                    warn!(path = %source.path.display(), error = %err, "failed to reload gitshard config");
                }
            }
        })
    }
}

impl ConfigSource for FileConfigSource {
    fn addresses(&self) -> Vec<String> {
        self.memory.addresses()
    }

    fn pinned(&self) -> HashMap<String, String> {
        self.memory.pinned()
    }

    fn watch(&self, callback: WatchCallback) {
        self.memory.watch(callback);
    }
}
