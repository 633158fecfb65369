//! Error types for shard routing and connection lookup.

use crate::admission::AdmissionError;
use crate::dial::DialError;

/// Errors returned to callers of the router.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The configured address list is empty, so nothing can own a repository.
    #[error("no gitserver addresses configured")]
    NoAddresses,
    /// The connection set has no outcome for an address its own table names.
    /// This means the set was built incorrectly and is a bug, not a transient failure.
    #[error("no connection found for address {address}")]
    NoConnection { address: String },
    /// The dial failure captured for this address during the last rebuild.
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
}

/// Result alias for routing operations.
pub type Result<T> = std::result::Result<T, Error>;
