//! Kaisen Cache - Namespaced Distributed Cache Access
//!
//! A client-side access layer over a pool of memcached-style servers:
//!
//! - [`ServerPool`] spreads keys over weighted servers on a consistent hash
//!   ring, evicts servers after consecutive failures and reconnects them in
//!   the background.
//! - [`Cache`] is the typed facade: get/set/cas/counters/server commands,
//!   each bounded by a timeout, in a `try_*` form and a sentinel form.
//! - Namespaces group keys under a versioned token, so a whole group is
//!   invalidated by writing one key.
//! - Concurrent single-key gets to one server are merged into one
//!   multi-get.
//!
//! Transport is pluggable through [`Connector`] / [`CacheConnection`];
//! [`InMemoryConnector`] is a complete in-process implementation.

mod batch;
pub mod cas;
pub mod client;
pub mod codec;
pub mod counter;
mod deadline;
pub mod key;
pub mod memory;
pub mod namespace;
pub mod pool;
pub mod store;

pub use cas::retry_cas;
pub use client::Cache;
pub use codec::{JsonCodec, StringCodec, ValueCodec, JSON_FLAGS, STRING_FLAGS};
pub use counter::Counter;
pub use key::{control_key, KeyNamespacer, NamespaceToken, WireKey};
pub use memory::{InMemoryConnection, InMemoryConnector, InMemoryStore};
pub use namespace::NamespaceScope;
pub use pool::{
    Endpoint, EndpointEvent, ListenerChain, PoolStateListener, ReconnectRequest, ServerPool,
    ShutdownEvent,
};
pub use store::{CacheConnection, Connector, StoreResult};

pub use kaisen_core::{
    CacheConfig, CacheError, CacheResult, CacheStats, CachedData, CasOutcome, CasToken, CasValue,
    CodecError, ConfigError, ContractViolation, EndpointHealth, HealthStatus, KeyDistribution,
    OpOptions, ServerAddress, ServerSpec, ServerStats, StoreError,
};
