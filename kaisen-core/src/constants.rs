//! Constants for the kaisen cache layer
//!
//! Centralizing defaults keeps the configuration, the pool and the facade
//! agreeing on the same numbers.

// ============================================================================
// BATCHING
// ============================================================================

/// Maximum number of keys merged into one multi-get round trip
pub const DEFAULT_MERGE_FACTOR: usize = 150;

// ============================================================================
// TIMEOUTS
// ============================================================================

/// Default connect timeout in milliseconds (1 minute)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 60_000;

/// Default per-operation timeout in milliseconds
pub const DEFAULT_OP_TIMEOUT_MS: u64 = 1_000;

/// Default interval between reconnect passes in milliseconds
pub const DEFAULT_HEAL_INTERVAL_MS: u64 = 2_000;

// ============================================================================
// POOL
// ============================================================================

/// Default number of connections per endpoint
pub const DEFAULT_POOL_SIZE: usize = 1;

/// Default consecutive timeout/IO failures before an endpoint is evicted.
/// Large enough that eviction effectively never happens unless configured.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 1_000;

/// Default weight of a server added without an explicit weight
pub const DEFAULT_SERVER_WEIGHT: u32 = 1;

/// Largest accepted server weight
pub const MAX_SERVER_WEIGHT: u32 = 1_000;

/// Default memcached port used when a server spec has no port
pub const DEFAULT_PORT: u16 = 11211;

/// Virtual nodes per unit of weight on the ketama continuum
pub const KETAMA_POINTS_PER_WEIGHT: u32 = 160;

// ============================================================================
// KEYS AND VALUES
// ============================================================================

/// Maximum length of a wire key in bytes
pub const MAX_KEY_LENGTH: usize = 250;

/// Maximum encoded payload size in bytes (1 MiB)
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Logical key prefix of the namespace token control keys
pub const NAMESPACE_TOKEN_KEY_PREFIX: &str = "namespace-token:";

/// First character of a namespace token segment inside a wire key.
/// Logical keys may not start with it.
pub const NAMESPACE_TOKEN_MARKER: char = '@';

/// Separator between the token's namespace name and its version
pub const NAMESPACE_VERSION_SEPARATOR: char = '#';

/// Separator between wire key segments
pub const KEY_SEPARATOR: char = ':';

// ============================================================================
// SENTINELS
// ============================================================================

/// Counter value returned by the sentinel API when incr/decr cannot complete
pub const COUNTER_FAILURE: i64 = -1;
