//! # gitshard
//!
//! Client-side routing for a sharded fleet of git servers.
//!
//! Repositories are spread over an ordered list of shard addresses by hashing
//! their normalized names, with per-repository pins taking precedence. The
//! [`ShardRouter`] keeps one connection per shard, rebuilds them when the
//! address list changes, and routes every call through a single process-wide
//! [`AdmissionController`] that bounds the number of RPCs in flight.
//!
//! ```no_run
//! use std::sync::Arc;
//! use gitshard::{AdmissionController, GitShardConfig, MemoryConfigSource, ShardRouter, TonicDialer};
//!
//! # #[tokio::main] async fn main() -> anyhow::Result<()> {
//! let config = GitShardConfig::from_env(None)?;
//! let router = ShardRouter::new(
//!     Arc::new(MemoryConfigSource::from_config(&config)),
//!     TonicDialer::current(config.dial.clone())?,
//!     Arc::new(AdmissionController::new(config.admission_limit)),
//! );
//! let channel = router.conn_for_repo("github.com/sourcegraph/sourcegraph")?;
//! # let _ = channel; Ok(()) }
//! ```

pub mod admission;
pub mod config;
pub mod conns;
pub mod dial;
pub mod error;
pub mod metrics;
pub mod placement;
pub mod repo;
pub mod router;

pub use admission::{AdmissionController, AdmissionError, AdmissionLayer, Admitted, StreamSlot};
pub use config::{ConfigSource, FileConfigSource, GitShardConfig, MemoryConfigSource};
pub use conns::{AddressWithConn, ConnectionSet, DialOutcome};
pub use dial::{Dial, DialError, ShardChannel, TonicDialer};
pub use error::{Error, Result};
pub use metrics::MetricsSnapshot;
pub use placement::{addr_for_key, addr_for_repo, AddressTable};
pub use repo::{normalize_repo, undeleted_repo_name};
pub use router::ShardRouter;
