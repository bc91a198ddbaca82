//! Counter handle.
//!
//! Counters are stored as decimal text and updated with the store's native
//! `incr`/`decr`, so they bypass the facade's value codec. A missing counter
//! is created holding the handle's initial value.

use crate::client::Cache;
use crate::codec::ValueCodec;
use kaisen_core::{CacheResult, CachedData, OpOptions, COUNTER_FAILURE};

/// A decimal counter under one logical key.
///
/// Obtained from [`Cache::counter`]. The handle borrows the facade, so it
/// uses whatever namespace is active on it.
pub struct Counter<'a, T, C> {
    cache: &'a Cache<T, C>,
    key: String,
    initial: u64,
}

impl<'a, T, C> Counter<'a, T, C>
where
    T: Send + Sync + 'static,
    C: ValueCodec<T> + 'static,
{
    pub(crate) fn new(cache: &'a Cache<T, C>, key: String, initial: u64) -> Self {
        Self {
            cache,
            key,
            initial,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn initial(&self) -> u64 {
        self.initial
    }

    /// Current value, or `None` if the counter does not exist yet.
    pub async fn try_get(&self, opts: OpOptions) -> CacheResult<Option<u64>> {
        let raw = self
            .cache
            .on_key("counter_get", &self.key, &opts, |conn, wire| async move {
                let keys = [wire.into_string()];
                conn.get_multi(&keys)
                    .await
                    .map(|mut found| found.remove(&keys[0]))
            })
            .await?;
        Ok(raw.and_then(|data| parse_decimal(&data)))
    }

    /// Current value, or `-1` if missing or unreadable.
    pub async fn get(&self, opts: OpOptions) -> i64 {
        let result = self.try_get(opts).await;
        to_sentinel(self.cache.settle("counter_get", &self.key, result).flatten())
    }

    /// Overwrite the counter.
    pub async fn try_set(&self, value: u64, opts: OpOptions) -> CacheResult<bool> {
        let exptime = opts.expiration.unwrap_or(self.cache.expiration());
        let data = CachedData::new(0, value.to_string().into_bytes());
        self.cache
            .on_key("counter_set", &self.key, &opts, move |conn, wire| async move {
                conn.set(wire.as_str(), data, exptime).await
            })
            .await
    }

    pub async fn set(&self, value: u64, opts: OpOptions) -> bool {
        let result = self.try_set(value, opts).await;
        self.cache
            .settle("counter_set", &self.key, result)
            .unwrap_or(false)
    }

    /// Add `delta`, creating the counter at its initial value if missing.
    pub async fn try_incr(&self, delta: u64, opts: OpOptions) -> CacheResult<Option<u64>> {
        self.cache
            .try_incr(&self.key, delta, Some(self.initial), opts)
            .await
    }

    pub async fn incr(&self, delta: u64, opts: OpOptions) -> i64 {
        self.cache
            .incr(&self.key, delta, Some(self.initial), opts)
            .await
    }

    /// Subtract `delta` (saturating at zero), creating the counter at its
    /// initial value if missing.
    pub async fn try_decr(&self, delta: u64, opts: OpOptions) -> CacheResult<Option<u64>> {
        self.cache
            .try_decr(&self.key, delta, Some(self.initial), opts)
            .await
    }

    pub async fn decr(&self, delta: u64, opts: OpOptions) -> i64 {
        self.cache
            .decr(&self.key, delta, Some(self.initial), opts)
            .await
    }
}

impl<T, C> std::fmt::Debug for Counter<'_, T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("key", &self.key)
            .field("initial", &self.initial)
            .finish()
    }
}

fn parse_decimal(data: &CachedData) -> Option<u64> {
    std::str::from_utf8(&data.data).ok()?.trim().parse().ok()
}

fn to_sentinel(value: Option<u64>) -> i64 {
    value
        .map(|n| i64::try_from(n).unwrap_or(i64::MAX))
        .unwrap_or(COUNTER_FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryConnector;
    use crate::pool::ServerPool;
    use kaisen_core::CacheConfig;
    use std::sync::Arc;

    async fn cache() -> Cache<String> {
        let pool = ServerPool::connect(
            CacheConfig::new().with_heal_session(false),
            Arc::new(InMemoryConnector::new()),
            "mem:1",
        )
        .await
        .unwrap();
        Cache::new(pool, "counters").unwrap()
    }

    #[tokio::test]
    async fn test_counter_starts_at_initial() {
        let cache = cache().await;
        let hits = cache.counter("hits", 10);
        assert_eq!(hits.get(OpOptions::new()).await, -1);
        assert_eq!(hits.incr(1, OpOptions::new()).await, 10);
        assert_eq!(hits.incr(5, OpOptions::new()).await, 15);
        assert_eq!(hits.get(OpOptions::new()).await, 15);
    }

    #[tokio::test]
    async fn test_counter_set_and_decr() {
        let cache = cache().await;
        let stock = cache.counter("stock", 0);
        assert!(stock.set(3, OpOptions::new()).await);
        assert_eq!(stock.decr(2, OpOptions::new()).await, 1);
        assert_eq!(stock.decr(5, OpOptions::new()).await, 0);
        assert_eq!(stock.try_get(OpOptions::new()).await.unwrap(), Some(0));
    }
}
