//! Default constants for gitshard configuration.

// =============================================================================
// Admission Defaults
// =============================================================================

/// Maximum gitserver calls in flight across every shard connection.
pub const DEFAULT_ADMISSION_LIMIT: usize = 500;

// =============================================================================
// Dial Defaults
// =============================================================================

/// Scheme prepended to `host:port` shard addresses when dialing.
pub const DEFAULT_DIAL_SCHEME: &str = "http";

/// Timeout for establishing the underlying TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// TCP keepalive interval on shard connections.
pub const DEFAULT_TCP_KEEPALIVE_SECS: u64 = 30;

// =============================================================================
// Environment
// =============================================================================

/// Prefix for environment overrides, e.g. `GITSHARD_ADMISSION_LIMIT`.
pub const ENV_PREFIX: &str = "GITSHARD_";

/// Separator between nested keys in environment overrides,
/// e.g. `GITSHARD_DIAL__CONNECT_TIMEOUT_MS`.
pub const ENV_NESTING: &str = "__";
