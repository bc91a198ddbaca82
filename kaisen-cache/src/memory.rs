//! In-memory remote store.
//!
//! [`InMemoryConnector`] hands out connections to one [`InMemoryStore`] per
//! server address, so a reconnect sees the data written before it. The store
//! follows the usual memcached semantics for storage commands, compare
//! tokens, counters, relative expirations and delayed flushes. It backs the
//! crate's tests and is handy for applications that want a cache-shaped
//! fake in their own tests.

use crate::store::{CacheConnection, Connector, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use kaisen_core::{
    CachedData, CasOutcome, CasToken, CasValue, ServerAddress, ServerStats, StoreError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    data: CachedData,
    cas: CasToken,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Debug, Default)]
struct Entries {
    items: HashMap<String, Entry>,
    flush_at: Option<Instant>,
}

/// Data held by one fake server.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<Entries>,
    next_cas: AtomicU64,
    calls: DashMap<&'static str, u64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls made for `operation` (e.g. `"get_multi"`, `"delete"`).
    pub fn call_count(&self, operation: &str) -> u64 {
        self.calls.get(operation).map(|c| *c).unwrap_or(0)
    }

    /// Total calls across every operation.
    pub fn total_calls(&self) -> u64 {
        self.calls.iter().map(|c| *c.value()).sum()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .items
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw payload stored under a wire key, bypassing call counting.
    pub fn peek(&self, key: &str) -> Option<CachedData> {
        let now = Instant::now();
        self.lock()
            .items
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.data.clone())
    }

    /// Wire keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .lock()
            .items
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn record(&self, operation: &'static str) {
        *self.calls.entry(operation).or_insert(0) += 1;
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock and drop anything expired or flushed.
    fn live(&self) -> MutexGuard<'_, Entries> {
        let mut guard = self.lock();
        let now = Instant::now();
        if guard.flush_at.map(|at| at <= now).unwrap_or(false) {
            guard.items.clear();
            guard.flush_at = None;
        }
        guard.items.retain(|_, e| e.is_live(now));
        guard
    }

    fn next_cas(&self) -> CasToken {
        self.next_cas.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn entry(&self, data: CachedData, exptime: u32) -> Entry {
        Entry {
            data,
            cas: self.next_cas(),
            expires_at: expires_at(exptime),
        }
    }

    fn counter(
        &self,
        key: &str,
        initial: Option<u64>,
        exptime: u32,
        apply: impl FnOnce(u64) -> u64,
    ) -> StoreResult<Option<u64>> {
        let mut entries = self.live();
        let existing = entries.items.get(key).map(|e| e.data.data.clone());
        let current = match existing {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| StoreError::NonNumeric {
                    key: key.to_string(),
                })?,
            None => match initial {
                Some(initial) => {
                    let entry =
                        self.entry(CachedData::new(0, initial.to_string().into_bytes()), exptime);
                    entries.items.insert(key.to_string(), entry);
                    return Ok(Some(initial));
                }
                None => return Ok(None),
            },
        };

        let next = apply(current);
        let cas = self.next_cas();
        if let Some(entry) = entries.items.get_mut(key) {
            entry.data.data = next.to_string().into_bytes();
            entry.cas = cas;
        }
        Ok(Some(next))
    }
}

fn expires_at(exptime: u32) -> Option<Instant> {
    match exptime {
        0 => None,
        secs => Some(Instant::now() + Duration::from_secs(u64::from(secs))),
    }
}

/// A connection to an [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemoryConnection {
    server: ServerAddress,
    store: Arc<InMemoryStore>,
    closed: AtomicBool,
}

impl InMemoryConnection {
    pub fn new(server: ServerAddress, store: Arc<InMemoryStore>) -> Self {
        Self {
            server,
            store,
            closed: AtomicBool::new(false),
        }
    }

    fn open(&self, operation: &'static str) -> StoreResult<&InMemoryStore> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed {
                server: self.server.to_string(),
            });
        }
        self.store.record(operation);
        Ok(&self.store)
    }
}

#[async_trait]
impl CacheConnection for InMemoryConnection {
    async fn get_multi(&self, keys: &[String]) -> StoreResult<HashMap<String, CachedData>> {
        let store = self.open("get_multi")?;
        let entries = store.live();
        Ok(keys
            .iter()
            .filter_map(|k| entries.items.get(k).map(|e| (k.clone(), e.data.clone())))
            .collect())
    }

    async fn gets_multi(
        &self,
        keys: &[String],
    ) -> StoreResult<HashMap<String, CasValue<CachedData>>> {
        let store = self.open("gets_multi")?;
        let entries = store.live();
        Ok(keys
            .iter()
            .filter_map(|k| {
                entries
                    .items
                    .get(k)
                    .map(|e| (k.clone(), CasValue::new(e.data.clone(), e.cas)))
            })
            .collect())
    }

    async fn set(&self, key: &str, data: CachedData, exptime: u32) -> StoreResult<bool> {
        let store = self.open("set")?;
        let entry = store.entry(data, exptime);
        store.live().items.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn add(&self, key: &str, data: CachedData, exptime: u32) -> StoreResult<bool> {
        let store = self.open("add")?;
        let mut entries = store.live();
        if entries.items.contains_key(key) {
            return Ok(false);
        }
        entries.items.insert(key.to_string(), store.entry(data, exptime));
        Ok(true)
    }

    async fn replace(&self, key: &str, data: CachedData, exptime: u32) -> StoreResult<bool> {
        let store = self.open("replace")?;
        let mut entries = store.live();
        if !entries.items.contains_key(key) {
            return Ok(false);
        }
        entries.items.insert(key.to_string(), store.entry(data, exptime));
        Ok(true)
    }

    async fn append(&self, key: &str, data: CachedData) -> StoreResult<bool> {
        let store = self.open("append")?;
        let cas = store.next_cas();
        let mut entries = store.live();
        match entries.items.get_mut(key) {
            Some(entry) => {
                entry.data.data.extend_from_slice(&data.data);
                entry.cas = cas;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn prepend(&self, key: &str, data: CachedData) -> StoreResult<bool> {
        let store = self.open("prepend")?;
        let cas = store.next_cas();
        let mut entries = store.live();
        match entries.items.get_mut(key) {
            Some(entry) => {
                let mut joined = data.data;
                joined.extend_from_slice(&entry.data.data);
                entry.data.data = joined;
                entry.cas = cas;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cas(
        &self,
        key: &str,
        data: CachedData,
        exptime: u32,
        cas: CasToken,
    ) -> StoreResult<CasOutcome> {
        let store = self.open("cas")?;
        let mut entries = store.live();
        match entries.items.get(key).map(|e| e.cas) {
            None => Ok(CasOutcome::NotFound),
            Some(current) if current != cas => Ok(CasOutcome::Conflict),
            Some(_) => {
                entries.items.insert(key.to_string(), store.entry(data, exptime));
                Ok(CasOutcome::Stored)
            }
        }
    }

    async fn delete(&self, key: &str, cas: Option<CasToken>) -> StoreResult<CasOutcome> {
        let store = self.open("delete")?;
        let mut entries = store.live();
        match (entries.items.get(key).map(|e| e.cas), cas) {
            (None, _) => Ok(CasOutcome::NotFound),
            (Some(current), Some(cas)) if current != cas => Ok(CasOutcome::Conflict),
            (Some(_), _) => {
                entries.items.remove(key);
                Ok(CasOutcome::Stored)
            }
        }
    }

    async fn touch(&self, key: &str, exptime: u32) -> StoreResult<bool> {
        let store = self.open("touch")?;
        let mut entries = store.live();
        match entries.items.get_mut(key) {
            Some(entry) => {
                entry.expires_at = expires_at(exptime);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_and_touch(&self, key: &str, exptime: u32) -> StoreResult<Option<CachedData>> {
        let store = self.open("get_and_touch")?;
        let mut entries = store.live();
        Ok(entries.items.get_mut(key).map(|entry| {
            entry.expires_at = expires_at(exptime);
            entry.data.clone()
        }))
    }

    async fn incr(
        &self,
        key: &str,
        delta: u64,
        initial: Option<u64>,
        exptime: u32,
    ) -> StoreResult<Option<u64>> {
        self.open("incr")?
            .counter(key, initial, exptime, |n| n.wrapping_add(delta))
    }

    async fn decr(
        &self,
        key: &str,
        delta: u64,
        initial: Option<u64>,
        exptime: u32,
    ) -> StoreResult<Option<u64>> {
        self.open("decr")?
            .counter(key, initial, exptime, |n| n.saturating_sub(delta))
    }

    async fn flush_all(&self, delay: u32) -> StoreResult<()> {
        let store = self.open("flush_all")?;
        let mut entries = store.lock();
        if delay == 0 {
            entries.items.clear();
            entries.flush_at = None;
        } else {
            entries.flush_at = expires_at(delay);
        }
        Ok(())
    }

    async fn stats(&self, item: Option<&str>) -> StoreResult<ServerStats> {
        let store = self.open("stats")?;
        let count = store.live().items.len();
        let mut stats = ServerStats::new();
        match item {
            None => {
                stats.insert("curr_items".to_string(), count.to_string());
                stats.insert(
                    "cmd_get".to_string(),
                    (store.call_count("get_multi") + store.call_count("gets_multi")).to_string(),
                );
                stats.insert("cmd_set".to_string(), store.call_count("set").to_string());
                stats.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
            }
            Some(item) => {
                stats.insert(format!("{}:number", item), count.to_string());
            }
        }
        Ok(stats)
    }

    async fn version(&self) -> StoreResult<String> {
        self.open("version")?;
        Ok(format!("kaisen-memory {}", env!("CARGO_PKG_VERSION")))
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector producing [`InMemoryConnection`]s, one store per address.
#[derive(Debug, Default)]
pub struct InMemoryConnector {
    stores: DashMap<ServerAddress, Arc<InMemoryStore>>,
    connects: AtomicU64,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store behind `address`, created on first use.
    pub fn store(&self, address: &ServerAddress) -> Arc<InMemoryStore> {
        self.stores
            .entry(address.clone())
            .or_insert_with(|| Arc::new(InMemoryStore::new()))
            .clone()
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Calls across every store.
    pub fn total_calls(&self) -> u64 {
        self.stores.iter().map(|s| s.value().total_calls()).sum()
    }

    /// Calls for `operation` across every store.
    pub fn call_count(&self, operation: &str) -> u64 {
        self.stores
            .iter()
            .map(|s| s.value().call_count(operation))
            .sum()
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, address: &ServerAddress) -> StoreResult<Arc<dyn CacheConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryConnection::new(
            address.clone(),
            self.store(address),
        )))
    }
}
