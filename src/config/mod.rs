//! Layered configuration for gitshard.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (gitshard.toml)
//! ```toml
//! admission_limit = 500
//!
//! [shards]
//! addresses = ["gitserver-0:3178", "gitserver-1:3178", "gitserver-2:3178"]
//!
//! [shards.pinned]
//! "github.com/sourcegraph/sourcegraph" = "gitserver-0:3178"
//!
//! [dial]
//! connect_timeout_ms = 5000
//! ```

mod defaults;
mod source;

pub use defaults::*;
pub use source::{ConfigSource, FileConfigSource, MemoryConfigSource, WatchCallback};

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Main configuration for the gitserver client layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitShardConfig {
    /// Admission controller capacity (calls in flight across all shards)
    pub admission_limit: usize,
    /// Shard addresses and pinned repositories
    pub shards: ShardsConfig,
    /// How shard connections are dialed
    pub dial: DialConfig,
}

impl Default for GitShardConfig {
    fn default() -> Self {
        Self {
            admission_limit: DEFAULT_ADMISSION_LIMIT,
            shards: ShardsConfig::default(),
            dial: DialConfig::default(),
        }
    }
}

impl GitShardConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(GitShardConfig::default()));

        // Layer 1: Config file (if provided). A named file must exist.
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file_exact(path));
        }

        // Layer 2: Environment variables with GITSHARD_ prefix
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split(ENV_NESTING));

        // Layer 3: CLI overrides
        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    /// Configured addresses with blank entries removed.
    pub fn addresses(&self) -> Vec<String> {
        normalize_addresses(&self.shards.addresses)
    }
}

/// Shard topology inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardsConfig {
    /// Ordered `host:port` list; a repository's shard depends on its position
    pub addresses: Vec<String>,
    /// Repository name to address overrides
    pub pinned: HashMap<String, String>,
}

/// Dial options for shard connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialConfig {
    /// Scheme used for addresses that do not carry one
    pub scheme: String,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// TCP keepalive in seconds (0 disables)
    pub tcp_keepalive_secs: u64,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_DIAL_SCHEME.to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            tcp_keepalive_secs: DEFAULT_TCP_KEEPALIVE_SECS,
        }
    }
}

impl DialConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tcp_keepalive(&self) -> Option<Duration> {
        (self.tcp_keepalive_secs > 0).then(|| Duration::from_secs(self.tcp_keepalive_secs))
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admission_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shards: Option<ShardsOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardsOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<String>>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

/// Trims addresses and drops empty entries.
pub fn normalize_addresses(addrs: &[String]) -> Vec<String> {
    addrs
        .iter()
        .map(|addr| addr.trim())
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
        .collect()
}

/// URI used to dial `addr`: `host:port` gets `scheme://` prepended,
/// addresses that already name a scheme are used as-is.
pub fn endpoint_uri(scheme: &str, addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("{scheme}://{addr}")
    }
}
