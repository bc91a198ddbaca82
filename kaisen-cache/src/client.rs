//! Cache operations facade.
//!
//! [`Cache`] is the typed entry point applications use. Every verb comes in
//! two layers:
//!
//! - `try_*` methods return [`CacheResult`] and keep absent values, CAS
//!   conflicts and failures apart.
//! - Plain methods collapse every failure into a sentinel (`None`, an empty
//!   map, `false` or `-1`), log it and count it in [`Cache::cache_stats`].
//!
//! Each call gets one deadline from its timeout (`OpOptions::timeout`, else
//! the pool's operation timeout). The namespace token lookup and the call
//! itself both draw on it. Calls are never retried.

use crate::codec::{JsonCodec, ValueCodec};
use crate::counter::Counter;
use crate::deadline::Deadline;
use crate::key::{control_key, KeyNamespacer, NamespaceToken, WireKey};
use crate::namespace::{NamespaceScope, ScopeGuard};
use crate::pool::{Endpoint, ServerPool};
use crate::store::{CacheConnection, StoreResult};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use kaisen_core::{
    new_namespace_version, CacheError, CacheResult, CacheStats, CachedData, CasOutcome, CasToken,
    CasValue, ContractViolation, OpOptions, ServerAddress, ServerStats, COUNTER_FAILURE,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Default)]
struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    soft_failures: AtomicU64,
    contract_violations: AtomicU64,
}

impl StatsRecorder {
    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            soft_failures: self.soft_failures.load(Ordering::Relaxed),
            contract_violations: self.contract_violations.load(Ordering::Relaxed),
        }
    }
}

/// Typed, namespaced access to a [`ServerPool`].
///
/// A `Cache` value is one call context: it owns its namespace scope.
/// Opening or closing a namespace needs `&mut self`, and cloning a `Cache`
/// gives an independent context with an empty scope that still shares the
/// pool, codec and statistics.
pub struct Cache<T, C = JsonCodec<T>> {
    pool: Arc<ServerPool>,
    codec: Arc<C>,
    keys: KeyNamespacer,
    expiration: u32,
    scope: NamespaceScope,
    stats: Arc<StatsRecorder>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Cache<T, JsonCodec<T>>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Facade storing JSON values under `prefix`.
    pub fn new(pool: Arc<ServerPool>, prefix: impl Into<String>) -> CacheResult<Self> {
        Self::with_codec(pool, prefix, JsonCodec::new())
    }
}

impl<T, C> Cache<T, C>
where
    T: Send + Sync + 'static,
    C: ValueCodec<T> + 'static,
{
    /// Facade storing values under `prefix` with a custom codec.
    pub fn with_codec(
        pool: Arc<ServerPool>,
        prefix: impl Into<String>,
        codec: C,
    ) -> CacheResult<Self> {
        let keys = KeyNamespacer::new(prefix, pool.config().sanitize_keys)?;
        Ok(Self {
            pool,
            codec: Arc::new(codec),
            keys,
            expiration: 0,
            scope: NamespaceScope::new(),
            stats: Arc::new(StatsRecorder::default()),
            _marker: PhantomData,
        })
    }

    /// Default expiration in seconds for writes (0 = never).
    pub fn with_expiration(mut self, seconds: u32) -> Self {
        self.expiration = seconds;
        self
    }

    pub fn prefix(&self) -> &str {
        self.keys.prefix()
    }

    pub fn expiration(&self) -> u32 {
        self.expiration
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    pub fn is_shutdown(&self) -> bool {
        self.pool.is_shutdown()
    }

    /// Hits, misses and failures seen by this facade and its clones.
    pub fn cache_stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// The innermost open namespace.
    pub fn active_namespace(&self) -> Option<String> {
        self.scope.active()
    }

    /// Handle for a decimal counter stored under `key`.
    pub fn counter(&self, key: impl Into<String>, initial: u64) -> Counter<'_, T, C> {
        Counter::new(self, key.into(), initial)
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub async fn try_get(&self, key: &str, opts: OpOptions) -> CacheResult<Option<T>> {
        let deadline = self.deadline(&opts);
        let wire = self.wire_key(key, deadline).await?;
        let endpoint = self.pool.route(wire.as_str())?;
        let result = self
            .pool
            .get_one(&endpoint, wire.into_string(), deadline)
            .await;
        self.pool.record(&endpoint, &result);
        let found = result?;
        self.observe(found.is_some());
        found.map(|data| self.decode(&data)).transpose()
    }

    /// The value at `key`, or `None` when absent or on failure.
    pub async fn get(&self, key: &str, opts: OpOptions) -> Option<T> {
        self.settle("get", key, self.try_get(key, opts).await)
            .flatten()
    }

    /// Read a value together with its compare token.
    pub async fn try_gets(&self, key: &str, opts: OpOptions) -> CacheResult<Option<CasValue<T>>> {
        self.gets_within(key, self.deadline(&opts)).await
    }

    async fn gets_within(&self, key: &str, deadline: Deadline) -> CacheResult<Option<CasValue<T>>> {
        let found = self
            .on_key_within("gets", key, deadline, |conn, wire| async move {
                let keys = [wire.into_string()];
                conn.gets_multi(&keys)
                    .await
                    .map(|mut found| found.remove(&keys[0]))
            })
            .await?;
        self.observe(found.is_some());
        found
            .map(|cas| Ok::<_, CacheError>(CasValue::new(self.decode(&cas.value)?, cas.cas)))
            .transpose()
    }

    pub async fn gets(&self, key: &str, opts: OpOptions) -> Option<CasValue<T>> {
        self.settle("gets", key, self.try_gets(key, opts).await)
            .flatten()
    }

    /// Fetch many keys. The result maps logical keys to values; absent keys
    /// are left out.
    pub async fn try_get_multi<K: AsRef<str>>(
        &self,
        keys: &[K],
        opts: OpOptions,
    ) -> CacheResult<HashMap<String, T>> {
        let found = self
            .fetch_multi("get_multi", keys, &opts, |conn, wires| {
                async move { conn.get_multi(&wires).await }.boxed()
            })
            .await?;
        found
            .into_iter()
            .map(|(key, data)| Ok::<_, CacheError>((key, self.decode(&data)?)))
            .collect()
    }

    pub async fn get_multi<K: AsRef<str>>(&self, keys: &[K], opts: OpOptions) -> HashMap<String, T> {
        let result = self.try_get_multi(keys, opts).await;
        self.settle("get_multi", &describe_keys(keys), result)
            .unwrap_or_default()
    }

    pub async fn try_gets_multi<K: AsRef<str>>(
        &self,
        keys: &[K],
        opts: OpOptions,
    ) -> CacheResult<HashMap<String, CasValue<T>>> {
        let found = self
            .fetch_multi("gets_multi", keys, &opts, |conn, wires| {
                async move { conn.gets_multi(&wires).await }.boxed()
            })
            .await?;
        found
            .into_iter()
            .map(|(key, cas)| {
                Ok::<_, CacheError>((key, CasValue::new(self.decode(&cas.value)?, cas.cas)))
            })
            .collect()
    }

    pub async fn gets_multi<K: AsRef<str>>(
        &self,
        keys: &[K],
        opts: OpOptions,
    ) -> HashMap<String, CasValue<T>> {
        let result = self.try_gets_multi(keys, opts).await;
        self.settle("gets_multi", &describe_keys(keys), result)
            .unwrap_or_default()
    }

    /// Read a value and reset its expiration to the call's expiration.
    pub async fn try_get_and_touch(&self, key: &str, opts: OpOptions) -> CacheResult<Option<T>> {
        let exptime = self.exptime(&opts);
        let found = self
            .on_key("get_and_touch", key, &opts, move |conn, wire| async move {
                conn.get_and_touch(wire.as_str(), exptime).await
            })
            .await?;
        self.observe(found.is_some());
        found.map(|data| self.decode(&data)).transpose()
    }

    pub async fn get_and_touch(&self, key: &str, opts: OpOptions) -> Option<T> {
        self.settle("get_and_touch", key, self.try_get_and_touch(key, opts).await)
            .flatten()
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Store unconditionally.
    pub async fn try_set(&self, key: &str, value: &T, opts: OpOptions) -> CacheResult<bool> {
        let data = self.encode("set", value)?;
        let exptime = self.exptime(&opts);
        self.write("set", key, &opts, move |conn, wire| async move {
            conn.set(wire.as_str(), data, exptime).await
        })
        .await
    }

    pub async fn set(&self, key: &str, value: &T, opts: OpOptions) -> bool {
        let result = self.try_set(key, value, opts).await;
        self.settle("set", key, result).unwrap_or(false)
    }

    /// Store only if absent.
    pub async fn try_add(&self, key: &str, value: &T, opts: OpOptions) -> CacheResult<bool> {
        let data = self.encode("add", value)?;
        let exptime = self.exptime(&opts);
        self.write("add", key, &opts, move |conn, wire| async move {
            conn.add(wire.as_str(), data, exptime).await
        })
        .await
    }

    pub async fn add(&self, key: &str, value: &T, opts: OpOptions) -> bool {
        let result = self.try_add(key, value, opts).await;
        self.settle("add", key, result).unwrap_or(false)
    }

    /// Store only if present.
    pub async fn try_replace(&self, key: &str, value: &T, opts: OpOptions) -> CacheResult<bool> {
        let data = self.encode("replace", value)?;
        let exptime = self.exptime(&opts);
        self.write("replace", key, &opts, move |conn, wire| async move {
            conn.replace(wire.as_str(), data, exptime).await
        })
        .await
    }

    pub async fn replace(&self, key: &str, value: &T, opts: OpOptions) -> bool {
        let result = self.try_replace(key, value, opts).await;
        self.settle("replace", key, result).unwrap_or(false)
    }

    /// Append the encoded value to an existing payload.
    ///
    /// Only meaningful with codecs whose payloads concatenate, such as
    /// [`StringCodec`](crate::codec::StringCodec).
    pub async fn try_append(&self, key: &str, value: &T, opts: OpOptions) -> CacheResult<bool> {
        let data = self.encode("append", value)?;
        self.write("append", key, &opts, move |conn, wire| async move {
            conn.append(wire.as_str(), data).await
        })
        .await
    }

    pub async fn append(&self, key: &str, value: &T, opts: OpOptions) -> bool {
        let result = self.try_append(key, value, opts).await;
        self.settle("append", key, result).unwrap_or(false)
    }

    /// Prepend the encoded value to an existing payload.
    pub async fn try_prepend(&self, key: &str, value: &T, opts: OpOptions) -> CacheResult<bool> {
        let data = self.encode("prepend", value)?;
        self.write("prepend", key, &opts, move |conn, wire| async move {
            conn.prepend(wire.as_str(), data).await
        })
        .await
    }

    pub async fn prepend(&self, key: &str, value: &T, opts: OpOptions) -> bool {
        let result = self.try_prepend(key, value, opts).await;
        self.settle("prepend", key, result).unwrap_or(false)
    }

    pub async fn try_delete(&self, key: &str, opts: OpOptions) -> CacheResult<bool> {
        self.write("delete", key, &opts, |conn, wire| async move {
            conn.delete(wire.as_str(), None)
                .await
                .map(|outcome| outcome.is_stored())
        })
        .await
    }

    pub async fn delete(&self, key: &str, opts: OpOptions) -> bool {
        let result = self.try_delete(key, opts).await;
        self.settle("delete", key, result).unwrap_or(false)
    }

    /// Delete only if the entry still carries `cas`.
    pub async fn try_delete_if(
        &self,
        key: &str,
        cas: CasToken,
        opts: OpOptions,
    ) -> CacheResult<CasOutcome> {
        self.on_key("delete", key, &opts, move |conn, wire| async move {
            conn.delete(wire.as_str(), Some(cas)).await
        })
        .await
    }

    pub async fn delete_if(&self, key: &str, cas: CasToken, opts: OpOptions) -> bool {
        let result = self.try_delete_if(key, cas, opts).await;
        self.settle("delete_if", key, result)
            .map(|outcome| outcome.is_stored())
            .unwrap_or(false)
    }

    /// Reset the expiration of `key` to the call's expiration.
    pub async fn try_touch(&self, key: &str, opts: OpOptions) -> CacheResult<bool> {
        let exptime = self.exptime(&opts);
        self.write("touch", key, &opts, move |conn, wire| async move {
            conn.touch(wire.as_str(), exptime).await
        })
        .await
    }

    pub async fn touch(&self, key: &str, opts: OpOptions) -> bool {
        let result = self.try_touch(key, opts).await;
        self.settle("touch", key, result).unwrap_or(false)
    }

    // ========================================================================
    // COUNTERS
    // ========================================================================

    /// Increment a decimal counter.
    ///
    /// With `initial`, a missing key is created holding `initial`. Returns
    /// `None` if the key is missing and no initial value was given.
    pub async fn try_incr(
        &self,
        key: &str,
        delta: u64,
        initial: Option<u64>,
        opts: OpOptions,
    ) -> CacheResult<Option<u64>> {
        let exptime = self.exptime(&opts);
        self.on_key("incr", key, &opts, move |conn, wire| async move {
            conn.incr(wire.as_str(), delta, initial, exptime).await
        })
        .await
    }

    /// Increment, returning the new value or `-1`.
    pub async fn incr(&self, key: &str, delta: u64, initial: Option<u64>, opts: OpOptions) -> i64 {
        let result = self.try_incr(key, delta, initial, opts).await;
        counter_sentinel(self.settle("incr", key, result))
    }

    /// Decrement a decimal counter. Counters never go below zero.
    pub async fn try_decr(
        &self,
        key: &str,
        delta: u64,
        initial: Option<u64>,
        opts: OpOptions,
    ) -> CacheResult<Option<u64>> {
        let exptime = self.exptime(&opts);
        self.on_key("decr", key, &opts, move |conn, wire| async move {
            conn.decr(wire.as_str(), delta, initial, exptime).await
        })
        .await
    }

    /// Decrement, returning the new value or `-1`.
    pub async fn decr(&self, key: &str, delta: u64, initial: Option<u64>, opts: OpOptions) -> i64 {
        let result = self.try_decr(key, delta, initial, opts).await;
        counter_sentinel(self.settle("decr", key, result))
    }

    // ========================================================================
    // CHECK-AND-SET
    // ========================================================================

    /// Write `value` only if the entry still carries `cas`.
    pub async fn try_cas(
        &self,
        key: &str,
        value: &T,
        cas: CasToken,
        opts: OpOptions,
    ) -> CacheResult<CasOutcome> {
        self.cas_within(key, value, cas, &opts, self.deadline(&opts))
            .await
    }

    async fn cas_within(
        &self,
        key: &str,
        value: &T,
        cas: CasToken,
        opts: &OpOptions,
        deadline: Deadline,
    ) -> CacheResult<CasOutcome> {
        let data = self.encode("cas", value)?;
        let exptime = self.exptime(opts);
        self.on_key_within("cas", key, deadline, move |conn, wire| async move {
            conn.cas(wire.as_str(), data, exptime, cas).await
        })
        .await
    }

    /// `true` only if the write won.
    pub async fn cas(&self, key: &str, value: &T, cas: CasToken, opts: OpOptions) -> bool {
        let result = self.try_cas(key, value, cas, opts).await;
        self.settle("cas", key, result)
            .map(|outcome| outcome.is_stored())
            .unwrap_or(false)
    }

    /// One read-modify-write attempt: read with `gets`, apply `f`, write with
    /// `cas`. A missing key yields [`CasOutcome::NotFound`] without calling
    /// `f`; a concurrent change yields [`CasOutcome::Conflict`]. Both round
    /// trips share one timeout.
    pub async fn try_cas_with<F>(&self, key: &str, f: F, opts: OpOptions) -> CacheResult<CasOutcome>
    where
        F: FnOnce(T) -> T,
    {
        let deadline = self.deadline(&opts);
        let Some(current) = self.gets_within(key, deadline).await? else {
            return Ok(CasOutcome::NotFound);
        };
        let next = f(current.value);
        self.cas_within(key, &next, current.cas, &opts, deadline)
            .await
    }

    pub async fn cas_with<F>(&self, key: &str, f: F, opts: OpOptions) -> bool
    where
        F: FnOnce(T) -> T,
    {
        let result = self.try_cas_with(key, f, opts).await;
        self.settle("cas_with", key, result)
            .map(|outcome| outcome.is_stored())
            .unwrap_or(false)
    }

    // ========================================================================
    // SERVER COMMANDS
    // ========================================================================

    /// Flush every available server. `opts.expiration` is the flush delay.
    ///
    /// Every server is attempted; the first failure is returned.
    pub async fn try_flush_all(&self, opts: OpOptions) -> CacheResult<()> {
        let delay = opts.expiration.unwrap_or(0);
        let results = self
            .fan_out("flush_all", self.pool.live_endpoints(), &opts, move |conn| {
                async move { conn.flush_all(delay).await }.boxed()
            })
            .await?;
        results.into_iter().map(|(_, r)| r).collect::<CacheResult<Vec<()>>>()?;
        Ok(())
    }

    pub async fn flush_all(&self, opts: OpOptions) -> bool {
        let result = self.try_flush_all(opts).await;
        self.settle("flush_all", "*", result).is_some()
    }

    /// Flush one server.
    pub async fn try_flush_all_on(&self, address: &ServerAddress, opts: OpOptions) -> CacheResult<()> {
        let endpoint = self.live_endpoint(address)?;
        let delay = opts.expiration.unwrap_or(0);
        let results = self
            .fan_out("flush_all", vec![endpoint], &opts, move |conn| {
                async move { conn.flush_all(delay).await }.boxed()
            })
            .await?;
        single(results, address)
    }

    pub async fn flush_all_on(&self, address: &ServerAddress, opts: OpOptions) -> bool {
        let result = self.try_flush_all_on(address, opts).await;
        self.settle("flush_all", &address.to_string(), result).is_some()
    }

    /// General statistics of every available server. Servers that fail to
    /// answer are logged and left out.
    pub async fn try_stats(&self, opts: OpOptions) -> CacheResult<HashMap<ServerAddress, ServerStats>> {
        self.collect_stats(None, opts).await
    }

    pub async fn stats(&self, opts: OpOptions) -> HashMap<ServerAddress, ServerStats> {
        let result = self.try_stats(opts).await;
        self.settle("stats", "*", result).unwrap_or_default()
    }

    /// `stats <item>` (e.g. `items`, `slabs`) of every available server.
    pub async fn try_stats_by_item(
        &self,
        item: &str,
        opts: OpOptions,
    ) -> CacheResult<HashMap<ServerAddress, ServerStats>> {
        self.collect_stats(Some(item.to_string()), opts).await
    }

    pub async fn stats_by_item(
        &self,
        item: &str,
        opts: OpOptions,
    ) -> HashMap<ServerAddress, ServerStats> {
        let result = self.try_stats_by_item(item, opts).await;
        self.settle("stats", item, result).unwrap_or_default()
    }

    /// General statistics of one server.
    pub async fn try_stats_on(&self, address: &ServerAddress, opts: OpOptions) -> CacheResult<ServerStats> {
        let endpoint = self.live_endpoint(address)?;
        let results = self
            .fan_out("stats", vec![endpoint], &opts, |conn| {
                async move { conn.stats(None).await }.boxed()
            })
            .await?;
        single(results, address)
    }

    pub async fn stats_on(&self, address: &ServerAddress, opts: OpOptions) -> Option<ServerStats> {
        let result = self.try_stats_on(address, opts).await;
        self.settle("stats", &address.to_string(), result)
    }

    /// Version string of every available server.
    pub async fn try_versions(&self, opts: OpOptions) -> CacheResult<HashMap<ServerAddress, String>> {
        let results = self
            .fan_out("version", self.pool.live_endpoints(), &opts, |conn| {
                async move { conn.version().await }.boxed()
            })
            .await?;
        Ok(keep_answers("version", results))
    }

    pub async fn versions(&self, opts: OpOptions) -> HashMap<ServerAddress, String> {
        let result = self.try_versions(opts).await;
        self.settle("version", "*", result).unwrap_or_default()
    }

    // ========================================================================
    // NAMESPACES
    // ========================================================================

    /// Open `name` as the innermost namespace of this context.
    pub fn begin_namespace(&mut self, name: &str) -> CacheResult<()> {
        if name.is_empty() {
            return Err(ContractViolation::EmptyNamespace.into());
        }
        self.scope.push(name);
        Ok(())
    }

    /// Close the innermost namespace and return its name.
    ///
    /// Closing with nothing open is a logged no-op, or
    /// [`ContractViolation::UnbalancedNamespace`] with `strict_namespaces`.
    pub fn end_namespace(&mut self) -> CacheResult<Option<String>> {
        match self.scope.pop() {
            Some(name) => Ok(Some(name)),
            None if self.pool.config().strict_namespaces => {
                Err(ContractViolation::UnbalancedNamespace.into())
            }
            None => {
                tracing::warn!(prefix = %self.keys.prefix(), "end_namespace without open namespace");
                Ok(None)
            }
        }
    }

    /// Run `f` with `name` as the innermost namespace.
    ///
    /// The namespace is closed when `f` finishes, fails, panics or is
    /// cancelled.
    ///
    /// ```ignore
    /// let saved = cache
    ///     .try_with_namespace("tenant-42", |c| {
    ///         async move { c.try_set("profile", &profile, OpOptions::new()).await }.boxed()
    ///     })
    ///     .await?;
    /// ```
    pub async fn try_with_namespace<R, F>(&mut self, name: &str, f: F) -> CacheResult<R>
    where
        F: for<'a> FnOnce(&'a Self) -> BoxFuture<'a, CacheResult<R>>,
    {
        if name.is_empty() {
            return Err(ContractViolation::EmptyNamespace.into());
        }
        let this: &Self = self;
        let _guard = ScopeGuard::enter(&this.scope, name);
        f(this).await
    }

    /// Like [`try_with_namespace`](Self::try_with_namespace), with failures
    /// collapsed to `None`.
    pub async fn with_namespace<R, F>(&mut self, name: &str, f: F) -> Option<R>
    where
        F: for<'a> FnOnce(&'a Self) -> BoxFuture<'a, CacheResult<R>>,
    {
        let result = self.try_with_namespace(name, f).await;
        self.settle("with_namespace", name, result)
    }

    /// Current token of `name`, creating one if the namespace is new.
    pub async fn try_namespace_token(&self, name: &str, opts: OpOptions) -> CacheResult<NamespaceToken> {
        self.namespace_token(name, self.deadline(&opts)).await
    }

    /// Make every key written under `name` unreachable by writing a new
    /// token. Member keys are left to expire.
    pub async fn try_invalidate_namespace(
        &self,
        name: &str,
        opts: OpOptions,
    ) -> CacheResult<NamespaceToken> {
        let control = control_key(name)?;
        let token = NamespaceToken::new(name, new_namespace_version());
        let deadline = self.deadline(&opts);
        let endpoint = self.pool.route(control.as_str())?;
        let payload = token_payload(&token);
        let result = match self.pool.connection(&endpoint) {
            Ok(conn) => deadline
                .bound("invalidate_namespace", async move {
                    conn.set(control.as_str(), payload, 0).await
                })
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        self.pool.record(&endpoint, &result);
        result?;
        tracing::debug!(namespace = name, version = %token.version(), "namespace invalidated");
        Ok(token)
    }

    pub async fn invalidate_namespace(&self, name: &str, opts: OpOptions) -> bool {
        let result = self.try_invalidate_namespace(name, opts).await;
        self.settle("invalidate_namespace", name, result).is_some()
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn deadline(&self, opts: &OpOptions) -> Deadline {
        Deadline::after(opts.timeout.unwrap_or(self.pool.config().op_timeout))
    }

    fn exptime(&self, opts: &OpOptions) -> u32 {
        opts.expiration.unwrap_or(self.expiration)
    }

    fn encode(&self, operation: &'static str, value: &T) -> CacheResult<CachedData> {
        let data = self.codec.encode(value)?;
        if self.codec.is_null(&data) {
            return Err(ContractViolation::NullValue { operation }.into());
        }
        Ok(data)
    }

    fn decode(&self, data: &CachedData) -> CacheResult<T> {
        Ok(self.codec.decode(data)?)
    }

    fn observe(&self, hit: bool) {
        let counter = if hit {
            &self.stats.hits
        } else {
            &self.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Collapse a result to its sentinel form, logging and counting failures.
    pub(crate) fn settle<R>(&self, operation: &'static str, key: &str, result: CacheResult<R>) -> Option<R> {
        match result {
            Ok(value) => Some(value),
            Err(e) if e.is_soft_failure() => {
                self.stats.soft_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(operation, key = %key, error = %e, "cache operation failed");
                None
            }
            Err(e) => {
                self.stats.contract_violations.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(operation, key = %key, error = %e, "cache call rejected");
                None
            }
        }
    }

    /// Wire key for `key` under the active namespace.
    ///
    /// The key is validated before the namespace token is fetched, so an
    /// invalid key never causes network traffic.
    pub(crate) async fn wire_key(&self, key: &str, deadline: Deadline) -> CacheResult<WireKey> {
        let Some(name) = self.scope.active() else {
            return Ok(self.keys.resolve(key, None)?);
        };
        self.keys.resolve(key, None)?;
        let token = self.namespace_token(&name, deadline).await?;
        Ok(self.keys.resolve(key, Some(&token))?)
    }

    async fn namespace_token(&self, name: &str, deadline: Deadline) -> CacheResult<NamespaceToken> {
        let control = control_key(name)?;
        let endpoint = self.pool.route(control.as_str())?;
        let result = self.load_token(&endpoint, &control, name, deadline).await;
        self.pool.record(&endpoint, &result);
        result
    }

    /// Read the token; if absent, `add` a fresh one; if the add loses a
    /// race, read the winner's.
    async fn load_token(
        &self,
        endpoint: &Arc<Endpoint>,
        control: &WireKey,
        name: &str,
        deadline: Deadline,
    ) -> CacheResult<NamespaceToken> {
        let stored = self
            .pool
            .get_one(endpoint, control.to_string(), deadline)
            .await?;
        if let Some(data) = stored {
            if let Some(version) = parse_token(&data) {
                return Ok(NamespaceToken::new(name, version));
            }
            tracing::warn!(namespace = name, "unreadable namespace token, replacing it");
            let token = NamespaceToken::new(name, new_namespace_version());
            let conn = self.pool.connection(endpoint)?;
            deadline
                .bound("set", conn.set(control.as_str(), token_payload(&token), 0))
                .await?;
            return Ok(token);
        }

        let token = NamespaceToken::new(name, new_namespace_version());
        let conn = self.pool.connection(endpoint)?;
        if deadline
            .bound("add", conn.add(control.as_str(), token_payload(&token), 0))
            .await?
        {
            return Ok(token);
        }

        let keys = [control.to_string()];
        let winner = deadline.bound("get", conn.get_multi(&keys)).await?;
        winner
            .get(&keys[0])
            .and_then(parse_token)
            .map(|version| NamespaceToken::new(name, version))
            .ok_or_else(|| CacheError::Interrupted {
                operation: "namespace_token",
            })
    }

    /// Run one single-key call: resolve, route, bound by the deadline, and
    /// report the outcome to the endpoint.
    pub(crate) async fn on_key<R, F, Fut>(
        &self,
        operation: &'static str,
        key: &str,
        opts: &OpOptions,
        call: F,
    ) -> CacheResult<R>
    where
        F: FnOnce(Arc<dyn CacheConnection>, WireKey) -> Fut,
        Fut: Future<Output = StoreResult<R>>,
    {
        self.on_key_within(operation, key, self.deadline(opts), call)
            .await
    }

    async fn on_key_within<R, F, Fut>(
        &self,
        operation: &'static str,
        key: &str,
        deadline: Deadline,
        call: F,
    ) -> CacheResult<R>
    where
        F: FnOnce(Arc<dyn CacheConnection>, WireKey) -> Fut,
        Fut: Future<Output = StoreResult<R>>,
    {
        let wire = self.wire_key(key, deadline).await?;
        let endpoint = self.pool.route(wire.as_str())?;
        let result = match self.pool.connection(&endpoint) {
            Ok(conn) => deadline.bound(operation, call(conn, wire)).await,
            Err(e) => Err(e),
        };
        self.pool.record(&endpoint, &result);
        result
    }

    /// A write that honours `no_reply`: the call is handed to a background
    /// task and reported as `true` once dispatched.
    async fn write<F, Fut>(
        &self,
        operation: &'static str,
        key: &str,
        opts: &OpOptions,
        call: F,
    ) -> CacheResult<bool>
    where
        F: FnOnce(Arc<dyn CacheConnection>, WireKey) -> Fut,
        Fut: Future<Output = StoreResult<bool>> + Send + 'static,
    {
        if !opts.no_reply {
            return self.on_key(operation, key, opts, call).await;
        }

        let deadline = self.deadline(opts);
        let wire = self.wire_key(key, deadline).await?;
        let endpoint = self.pool.route(wire.as_str())?;
        let conn = self.pool.connection(&endpoint)?;
        let pool = Arc::clone(&self.pool);
        let pending = call(conn, wire);
        tokio::spawn(async move {
            let result = deadline.bound(operation, pending).await;
            if let Err(e) = &result {
                tracing::warn!(operation, error = %e, "no-reply write failed");
            }
            pool.record(&endpoint, &result);
        });
        Ok(true)
    }

    /// Multi-key fetch: one round trip per endpoint and per `merge_factor`
    /// keys, all in flight at once. Results are keyed by logical key.
    async fn fetch_multi<K, V, F>(
        &self,
        operation: &'static str,
        keys: &[K],
        opts: &OpOptions,
        call: F,
    ) -> CacheResult<HashMap<String, V>>
    where
        K: AsRef<str>,
        V: Send + 'static,
        F: Fn(Arc<dyn CacheConnection>, Vec<String>) -> BoxFuture<'static, StoreResult<HashMap<String, V>>>,
    {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let deadline = self.deadline(opts);

        for key in keys {
            self.keys.resolve(key.as_ref(), None)?;
        }
        let token = match self.scope.active() {
            Some(name) => Some(self.namespace_token(&name, deadline).await?),
            None => None,
        };

        let mut logical: HashMap<String, String> = HashMap::new();
        let mut groups: HashMap<ServerAddress, (Arc<Endpoint>, Vec<String>)> = HashMap::new();
        for key in keys {
            let wire = self.keys.resolve(key.as_ref(), token.as_ref())?.into_string();
            if logical.contains_key(&wire) {
                continue;
            }
            let endpoint = self.pool.route(&wire)?;
            groups
                .entry(endpoint.address().clone())
                .or_insert_with(|| (endpoint, Vec::new()))
                .1
                .push(wire.clone());
            logical.insert(wire, key.as_ref().to_string());
        }

        let merge_factor = self.pool.config().merge_factor;
        let mut calls = Vec::new();
        for (endpoint, wires) in groups.into_values() {
            for chunk in wires.chunks(merge_factor) {
                calls.push((Arc::clone(&endpoint), chunk.to_vec()));
            }
        }

        let replies = join_all(calls.into_iter().map(|(endpoint, chunk)| {
            let call = &call;
            async move {
                let result = match self.pool.connection(&endpoint) {
                    Ok(conn) => deadline.bound(operation, call(conn, chunk)).await,
                    Err(e) => Err(e),
                };
                self.pool.record(&endpoint, &result);
                result
            }
        }))
        .await;

        let mut found = HashMap::new();
        for reply in replies {
            for (wire, value) in reply? {
                if let Some(key) = logical.get(&wire) {
                    found.insert(key.clone(), value);
                }
            }
        }

        self.stats
            .hits
            .fetch_add(found.len() as u64, Ordering::Relaxed);
        self.stats
            .misses
            .fetch_add((logical.len() - found.len()) as u64, Ordering::Relaxed);
        Ok(found)
    }

    /// Run a server command on each endpoint concurrently.
    async fn fan_out<R, F>(
        &self,
        operation: &'static str,
        endpoints: Vec<Arc<Endpoint>>,
        opts: &OpOptions,
        call: F,
    ) -> CacheResult<Vec<(ServerAddress, CacheResult<R>)>>
    where
        F: Fn(Arc<dyn CacheConnection>) -> BoxFuture<'static, StoreResult<R>>,
    {
        self.pool_running()?;
        let deadline = self.deadline(opts);
        let results = join_all(endpoints.into_iter().map(|endpoint| {
            let call = &call;
            async move {
                let result = match self.pool.connection(&endpoint) {
                    Ok(conn) => deadline.bound(operation, call(conn)).await,
                    Err(e) => Err(e),
                };
                self.pool.record(&endpoint, &result);
                (endpoint.address().clone(), result)
            }
        }))
        .await;
        Ok(results)
    }

    async fn collect_stats(
        &self,
        item: Option<String>,
        opts: OpOptions,
    ) -> CacheResult<HashMap<ServerAddress, ServerStats>> {
        let results = self
            .fan_out("stats", self.pool.live_endpoints(), &opts, move |conn| {
                let item = item.clone();
                async move { conn.stats(item.as_deref()).await }.boxed()
            })
            .await?;
        Ok(keep_answers("stats", results))
    }

    fn live_endpoint(&self, address: &ServerAddress) -> CacheResult<Arc<Endpoint>> {
        self.pool_running()?;
        self.pool
            .endpoint(address)
            .filter(|ep| ep.is_available())
            .ok_or_else(|| CacheError::Connectivity {
                reason: format!("{} is not an available server", address),
            })
    }

    fn pool_running(&self) -> CacheResult<()> {
        if self.pool.is_shutdown() {
            return Err(CacheError::Connectivity {
                reason: format!("pool {} is shut down", self.pool.name()),
            });
        }
        Ok(())
    }
}

impl<T, C> Clone for Cache<T, C> {
    /// A new call context on the same pool, codec and statistics, with an
    /// empty namespace scope.
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            codec: Arc::clone(&self.codec),
            keys: self.keys.clone(),
            expiration: self.expiration,
            scope: NamespaceScope::new(),
            stats: Arc::clone(&self.stats),
            _marker: PhantomData,
        }
    }
}

impl<T, C> std::fmt::Debug for Cache<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("prefix", &self.keys.prefix())
            .field("expiration", &self.expiration)
            .field("namespace", &self.scope.active())
            .field("pool", &self.pool)
            .finish()
    }
}

fn token_payload(token: &NamespaceToken) -> CachedData {
    CachedData::new(0, token.version().hyphenated().to_string().into_bytes())
}

fn parse_token(data: &CachedData) -> Option<Uuid> {
    std::str::from_utf8(&data.data)
        .ok()
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
}

fn counter_sentinel(value: Option<Option<u64>>) -> i64 {
    match value.flatten() {
        Some(n) => i64::try_from(n).unwrap_or(i64::MAX),
        None => COUNTER_FAILURE,
    }
}

fn single<R>(
    results: Vec<(ServerAddress, CacheResult<R>)>,
    address: &ServerAddress,
) -> CacheResult<R> {
    results
        .into_iter()
        .next()
        .map(|(_, result)| result)
        .unwrap_or_else(|| {
            Err(CacheError::Connectivity {
                reason: format!("{} did not answer", address),
            })
        })
}

fn keep_answers<R>(
    operation: &'static str,
    results: Vec<(ServerAddress, CacheResult<R>)>,
) -> HashMap<ServerAddress, R> {
    results
        .into_iter()
        .filter_map(|(address, result)| match result {
            Ok(value) => Some((address, value)),
            Err(e) => {
                tracing::warn!(operation, server = %address, error = %e, "server did not answer");
                None
            }
        })
        .collect()
}

fn describe_keys<K: AsRef<str>>(keys: &[K]) -> String {
    match keys {
        [] => String::new(),
        [only] => only.as_ref().to_string(),
        [first, rest @ ..] => format!("{} (+{} more)", first.as_ref(), rest.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryConnector;
    use kaisen_core::CacheConfig;
    use std::time::Duration;

    async fn cache() -> (Cache<u32>, Arc<InMemoryConnector>) {
        let connector = Arc::new(InMemoryConnector::new());
        let pool = ServerPool::connect(
            CacheConfig::new().with_heal_session(false),
            connector.clone(),
            "mem:1",
        )
        .await
        .unwrap();
        (Cache::new(pool, "unit").unwrap(), connector)
    }

    #[test]
    fn test_counter_sentinel() {
        assert_eq!(counter_sentinel(Some(Some(5))), 5);
        assert_eq!(counter_sentinel(Some(None)), COUNTER_FAILURE);
        assert_eq!(counter_sentinel(None), COUNTER_FAILURE);
        assert_eq!(counter_sentinel(Some(Some(u64::MAX))), i64::MAX);
    }

    #[test]
    fn test_token_payload_roundtrip() {
        let token = NamespaceToken::new("ns", new_namespace_version());
        assert_eq!(parse_token(&token_payload(&token)), Some(token.version()));
        assert_eq!(parse_token(&CachedData::new(0, b"garbage".to_vec())), None);
    }

    #[test]
    fn test_describe_keys() {
        let none: [&str; 0] = [];
        assert_eq!(describe_keys(&none), "");
        assert_eq!(describe_keys(&["a"]), "a");
        assert_eq!(describe_keys(&["a", "b", "c"]), "a (+2 more)");
    }

    #[tokio::test]
    async fn test_wire_key_embeds_active_token() {
        let (mut cache, _) = cache().await;
        let deadline = Deadline::after(Duration::from_secs(1));
        assert_eq!(cache.wire_key("k", deadline).await.unwrap().as_str(), "unit:k");

        cache.begin_namespace("ns").unwrap();
        let token = cache
            .try_namespace_token("ns", OpOptions::new())
            .await
            .unwrap();
        assert_eq!(
            cache.wire_key("k", deadline).await.unwrap().as_str(),
            format!("unit:{}:k", token.render())
        );
    }

    #[tokio::test]
    async fn test_settle_counts_by_bucket() {
        let (cache, _) = cache().await;
        let soft: CacheResult<()> = Err(CacheError::Interrupted { operation: "get" });
        let contract: CacheResult<()> = Err(ContractViolation::EmptyKey.into());

        assert_eq!(cache.settle("get", "k", Ok(1)), Some(1));
        assert_eq!(cache.settle("get", "k", soft), None);
        assert_eq!(cache.settle("get", "k", contract), None);

        let stats = cache.cache_stats();
        assert_eq!(stats.soft_failures, 1);
        assert_eq!(stats.contract_violations, 1);
    }

    #[tokio::test]
    async fn test_clone_shares_stats_not_scope() {
        let (mut cache, _) = cache().await;
        cache.begin_namespace("ns").unwrap();
        let other = cache.clone();
        assert_eq!(other.active_namespace(), None);
        assert_eq!(other.prefix(), "unit");

        let _ = other.get("missing", OpOptions::new()).await;
        assert_eq!(cache.cache_stats().misses, 1);
    }
}
