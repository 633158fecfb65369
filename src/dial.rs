//! Dialing shard connections.

use std::sync::Arc;

use tokio::runtime::{Handle, TryCurrentError};
use tonic::transport::{Channel, Endpoint};
use tower::Layer;
use tracing::debug;

use crate::admission::{AdmissionController, AdmissionLayer, Admitted};
use crate::config::{endpoint_uri, DialConfig};

/// A dial failure, kept and replayed to every caller asking for the address
/// until the address list changes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DialError {
    #[error("invalid gitserver address {address}: {message}")]
    InvalidAddress { address: String, message: String },
    #[error("failed to dial gitserver {address}: {message}")]
    Transport { address: String, message: String },
}

impl DialError {
    pub fn address(&self) -> &str {
        match self {
            Self::InvalidAddress { address, .. } | Self::Transport { address, .. } => address,
        }
    }
}

/// Establishes and tears down connections to shard addresses.
///
/// Every connection must route its calls through `admission`, so the bound
/// holds no matter which shard is called.
pub trait Dial: Send + Sync + 'static {
    type Conn: Clone + Send + Sync + 'static;

    fn dial(
        &self,
        address: &str,
        admission: &Arc<AdmissionController>,
    ) -> Result<Self::Conn, DialError>;

    /// Called once for each connection that is no longer reachable from the
    /// published connection set.
    fn close(&self, address: &str, conn: Self::Conn);
}

/// A tonic channel behind the admission layer. Wrap it in a generated
/// client, e.g. `GitserverServiceClient::new(conn)`.
pub type ShardChannel = Admitted<Channel>;

/// Dials lazily connected tonic channels.
///
/// Dialing never waits on the network: the channel connects on first use
/// and reconnects on its own. Only malformed addresses fail at dial time.
#[derive(Debug, Clone)]
pub struct TonicDialer {
    config: DialConfig,
    runtime: Handle,
}

impl TonicDialer {
    pub fn new(config: DialConfig, runtime: Handle) -> Self {
        Self { config, runtime }
    }

    /// Uses the runtime the caller is running on.
    pub fn current(config: DialConfig) -> Result<Self, TryCurrentError> {
        Ok(Self::new(config, Handle::try_current()?))
    }

    fn endpoint(&self, address: &str) -> Result<Endpoint, DialError> {
        let uri = endpoint_uri(&self.config.scheme, address);
        let endpoint = Endpoint::from_shared(uri).map_err(|err| DialError::InvalidAddress {
            address: address.to_string(),
            message: err.to_string(),
        })?;
        Ok(endpoint
            .connect_timeout(self.config.connect_timeout())
            .tcp_keepalive(self.config.tcp_keepalive()))
    }
}

impl Dial for TonicDialer {
    type Conn = ShardChannel;

    fn dial(
        &self,
        address: &str,
        admission: &Arc<AdmissionController>,
    ) -> Result<Self::Conn, DialError> {
        let endpoint = self.endpoint(address)?;
        // Channel construction spawns its worker onto the ambient runtime;
        // configuration callbacks may run on threads that have none.
        let _runtime = self.runtime.enter();
        let channel = endpoint.connect_lazy();
        debug!(address, "dialed gitserver channel");
        Ok(AdmissionLayer::new(Arc::clone(admission)).layer(channel))
    }

    fn close(&self, address: &str, conn: Self::Conn) {
        // The HTTP/2 connection shuts down once the last clone is dropped;
        // calls still holding a clone run to completion first.
        drop(conn);
        debug!(address, "closed gitserver channel");
    }
}
