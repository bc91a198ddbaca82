//! Outbound interface to the remote key-value store.
//!
//! The cache layer never speaks a wire protocol itself. A [`Connector`]
//! opens [`CacheConnection`]s to server addresses and the pool shares those
//! connections between every facade. Each call reports hit, miss, conflict
//! and failure distinctly; the facade decides what a caller gets to see.

use async_trait::async_trait;
use kaisen_core::{CachedData, CasOutcome, CasToken, CasValue, ServerAddress, ServerStats, StoreError};
use std::collections::HashMap;
use std::sync::Arc;

/// Result type for calls on a remote store.
pub type StoreResult<T> = Result<T, StoreError>;

/// One open connection to a remote cache server.
///
/// Expirations are in seconds, 0 meaning never. Storage commands return
/// `false` when the server declined to store (e.g. `add` on an existing key).
#[async_trait]
pub trait CacheConnection: Send + Sync {
    /// Fetch many keys in one round trip. Missing keys are absent from the map.
    async fn get_multi(&self, keys: &[String]) -> StoreResult<HashMap<String, CachedData>>;

    /// Like `get_multi`, with each value's compare token.
    async fn gets_multi(
        &self,
        keys: &[String],
    ) -> StoreResult<HashMap<String, CasValue<CachedData>>>;

    async fn set(&self, key: &str, data: CachedData, exptime: u32) -> StoreResult<bool>;

    async fn add(&self, key: &str, data: CachedData, exptime: u32) -> StoreResult<bool>;

    async fn replace(&self, key: &str, data: CachedData, exptime: u32) -> StoreResult<bool>;

    async fn append(&self, key: &str, data: CachedData) -> StoreResult<bool>;

    async fn prepend(&self, key: &str, data: CachedData) -> StoreResult<bool>;

    /// Write only if the entry still carries `cas`.
    async fn cas(
        &self,
        key: &str,
        data: CachedData,
        exptime: u32,
        cas: CasToken,
    ) -> StoreResult<CasOutcome>;

    /// Delete, optionally only if the entry still carries `cas`.
    async fn delete(&self, key: &str, cas: Option<CasToken>) -> StoreResult<CasOutcome>;

    async fn touch(&self, key: &str, exptime: u32) -> StoreResult<bool>;

    async fn get_and_touch(&self, key: &str, exptime: u32) -> StoreResult<Option<CachedData>>;

    /// Increment a decimal counter.
    ///
    /// With `initial`, a missing key is created holding `initial` in the same
    /// server-side step. Returns `None` when the key is missing and no
    /// initial value was given.
    async fn incr(
        &self,
        key: &str,
        delta: u64,
        initial: Option<u64>,
        exptime: u32,
    ) -> StoreResult<Option<u64>>;

    /// Decrement a decimal counter; never goes below zero.
    async fn decr(
        &self,
        key: &str,
        delta: u64,
        initial: Option<u64>,
        exptime: u32,
    ) -> StoreResult<Option<u64>>;

    /// Invalidate every entry, after `delay` seconds when non-zero.
    async fn flush_all(&self, delay: u32) -> StoreResult<()>;

    async fn stats(&self, item: Option<&str>) -> StoreResult<ServerStats>;

    async fn version(&self) -> StoreResult<String>;

    async fn close(&self) -> StoreResult<()>;
}

/// Opens connections to servers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &ServerAddress) -> StoreResult<Arc<dyn CacheConnection>>;
}
