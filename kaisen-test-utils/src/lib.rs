//! Kaisen Test Utilities
//!
//! Shared test infrastructure for the kaisen workspace:
//! - Proptest generators for keys, namespaces, addresses and configs
//! - A fault-injecting connector for failure and eviction scenarios
//! - Fixtures that build pools and facades over in-memory servers
//! - Assertions for the error taxonomy

pub use kaisen_cache::{
    Cache, CacheConnection, Connector, InMemoryConnector, ServerPool, StoreResult,
};
pub use kaisen_core::{
    CacheConfig, CacheError, CacheResult, CachedData, CasOutcome, CasToken, CasValue,
    ContractViolation, KeyDistribution, OpOptions, ServerAddress, ServerStats, StoreError,
};

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Failure behaviour applied to one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connects are refused and calls fail with an I/O error.
    Down,
    /// Calls never answer; callers hit their timeout.
    Hang,
    /// Calls answer after a delay.
    Latency(Duration),
}

/// Connector over in-memory servers whose faults can be switched at runtime.
///
/// Faults apply to connections already handed out, so a server can go bad
/// underneath a running pool.
#[derive(Debug, Default)]
pub struct FaultyConnector {
    inner: InMemoryConnector,
    faults: Arc<DashMap<ServerAddress, Fault>>,
    refused: AtomicU64,
}

impl FaultyConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fault(&self, address: &ServerAddress, fault: Fault) {
        self.faults.insert(address.clone(), fault);
    }

    pub fn clear_fault(&self, address: &ServerAddress) {
        self.faults.remove(address);
    }

    /// The in-memory servers behind the faults.
    pub fn memory(&self) -> &InMemoryConnector {
        &self.inner
    }

    /// Connects refused because the server was down.
    pub fn refused_connects(&self) -> u64 {
        self.refused.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FaultyConnector {
    async fn connect(&self, address: &ServerAddress) -> StoreResult<Arc<dyn CacheConnection>> {
        if self.faults.get(address).map(|f| *f) == Some(Fault::Down) {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Io {
                server: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let inner = self.inner.connect(address).await?;
        Ok(Arc::new(FaultyConnection {
            address: address.clone(),
            inner,
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct FaultyConnection {
    address: ServerAddress,
    inner: Arc<dyn CacheConnection>,
    faults: Arc<DashMap<ServerAddress, Fault>>,
}

impl FaultyConnection {
    async fn gate(&self) -> StoreResult<()> {
        let fault = self.faults.get(&self.address).map(|f| *f);
        match fault {
            None => Ok(()),
            Some(Fault::Down) => Err(StoreError::Io {
                server: self.address.to_string(),
                reason: "connection reset".to_string(),
            }),
            Some(Fault::Hang) => std::future::pending().await,
            Some(Fault::Latency(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl CacheConnection for FaultyConnection {
    async fn get_multi(&self, keys: &[String]) -> StoreResult<HashMap<String, CachedData>> {
        self.gate().await?;
        self.inner.get_multi(keys).await
    }

    async fn gets_multi(
        &self,
        keys: &[String],
    ) -> StoreResult<HashMap<String, CasValue<CachedData>>> {
        self.gate().await?;
        self.inner.gets_multi(keys).await
    }

    async fn set(&self, key: &str, data: CachedData, exptime: u32) -> StoreResult<bool> {
        self.gate().await?;
        self.inner.set(key, data, exptime).await
    }

    async fn add(&self, key: &str, data: CachedData, exptime: u32) -> StoreResult<bool> {
        self.gate().await?;
        self.inner.add(key, data, exptime).await
    }

    async fn replace(&self, key: &str, data: CachedData, exptime: u32) -> StoreResult<bool> {
        self.gate().await?;
        self.inner.replace(key, data, exptime).await
    }

    async fn append(&self, key: &str, data: CachedData) -> StoreResult<bool> {
        self.gate().await?;
        self.inner.append(key, data).await
    }

    async fn prepend(&self, key: &str, data: CachedData) -> StoreResult<bool> {
        self.gate().await?;
        self.inner.prepend(key, data).await
    }

    async fn cas(
        &self,
        key: &str,
        data: CachedData,
        exptime: u32,
        cas: CasToken,
    ) -> StoreResult<CasOutcome> {
        self.gate().await?;
        self.inner.cas(key, data, exptime, cas).await
    }

    async fn delete(&self, key: &str, cas: Option<CasToken>) -> StoreResult<CasOutcome> {
        self.gate().await?;
        self.inner.delete(key, cas).await
    }

    async fn touch(&self, key: &str, exptime: u32) -> StoreResult<bool> {
        self.gate().await?;
        self.inner.touch(key, exptime).await
    }

    async fn get_and_touch(&self, key: &str, exptime: u32) -> StoreResult<Option<CachedData>> {
        self.gate().await?;
        self.inner.get_and_touch(key, exptime).await
    }

    async fn incr(
        &self,
        key: &str,
        delta: u64,
        initial: Option<u64>,
        exptime: u32,
    ) -> StoreResult<Option<u64>> {
        self.gate().await?;
        self.inner.incr(key, delta, initial, exptime).await
    }

    async fn decr(
        &self,
        key: &str,
        delta: u64,
        initial: Option<u64>,
        exptime: u32,
    ) -> StoreResult<Option<u64>> {
        self.gate().await?;
        self.inner.decr(key, delta, initial, exptime).await
    }

    async fn flush_all(&self, delay: u32) -> StoreResult<()> {
        self.gate().await?;
        self.inner.flush_all(delay).await
    }

    async fn stats(&self, item: Option<&str>) -> StoreResult<ServerStats> {
        self.gate().await?;
        self.inner.stats(item).await
    }

    async fn version(&self) -> StoreResult<String> {
        self.gate().await?;
        self.inner.version().await
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.close().await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for kaisen types.

    use super::*;
    use proptest::prelude::*;

    /// A logical key that passes validation without sanitizing.
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_./-][a-zA-Z0-9:_./-]{0,39}"
    }

    /// Arbitrary printable text, including whitespace.
    pub fn arb_raw_key() -> impl Strategy<Value = String> {
        "\\PC{1,40}"
    }

    pub fn arb_namespace() -> impl Strategy<Value = String> {
        "[a-z0-9 #@:/-]{1,16}"
    }

    pub fn arb_server_address() -> impl Strategy<Value = ServerAddress> {
        ("[a-z][a-z0-9-]{0,15}", 1u16..=u16::MAX)
            .prop_map(|(host, port)| ServerAddress::new(host, port))
    }

    pub fn arb_key_distribution() -> impl Strategy<Value = KeyDistribution> {
        prop_oneof![Just(KeyDistribution::Ketama), Just(KeyDistribution::Modulo)]
    }

    /// A config that passes `validate()`.
    pub fn arb_valid_config() -> impl Strategy<Value = CacheConfig> {
        (
            1usize..500,
            any::<bool>(),
            1u64..5_000,
            1u32..2_000,
            1usize..8,
            any::<bool>(),
            arb_key_distribution(),
        )
            .prop_map(
                |(merge_factor, optimize_get, op_ms, threshold, pool_size, failure_mode, dist)| {
                    CacheConfig::new()
                        .with_merge_factor(merge_factor)
                        .with_optimize_get(optimize_get)
                        .with_op_timeout(Duration::from_millis(op_ms))
                        .with_failure_threshold(threshold)
                        .with_pool_size(pool_size)
                        .with_failure_mode(failure_mode)
                        .with_key_distribution(dist)
                },
            )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pools and facades over in-memory servers.

    use super::*;
    use serde::de::DeserializeOwned;
    use serde::Serialize;

    /// Config for tests: no background healing, short timeouts.
    pub fn test_config() -> CacheConfig {
        CacheConfig::new()
            .with_name("kaisen-test")
            .with_heal_session(false)
            .with_op_timeout(Duration::from_millis(200))
            .with_connect_timeout(Duration::from_millis(200))
    }

    /// Pool over in-memory servers, with the connector for inspection.
    pub async fn memory_pool(
        config: CacheConfig,
        servers: &str,
    ) -> (Arc<ServerPool>, Arc<InMemoryConnector>) {
        let connector = Arc::new(InMemoryConnector::new());
        let pool = ServerPool::connect(config, connector.clone(), servers)
            .await
            .unwrap_or_else(|e| panic!("failed to build pool for {servers}: {e}"));
        (pool, connector)
    }

    /// Pool over fault-injectable servers.
    pub async fn faulty_pool(
        config: CacheConfig,
        servers: &str,
    ) -> (Arc<ServerPool>, Arc<FaultyConnector>) {
        let connector = Arc::new(FaultyConnector::new());
        let pool = ServerPool::connect(config, connector.clone(), servers)
            .await
            .unwrap_or_else(|e| panic!("failed to build pool for {servers}: {e}"));
        (pool, connector)
    }

    /// JSON facade on `pool`.
    pub fn json_cache<T>(pool: &Arc<ServerPool>, prefix: &str) -> Cache<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Cache::new(Arc::clone(pool), prefix)
            .unwrap_or_else(|e| panic!("failed to build cache {prefix}: {e}"))
    }

    /// Route `tracing` output through the test harness. Safe to call more
    /// than once.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kaisen_cache=debug")),
            )
            .with_test_writer()
            .try_init();
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over the cache error taxonomy.

    use super::*;

    /// Assert that a CacheResult is a soft failure.
    #[track_caller]
    pub fn assert_soft_failure<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(e) if e.is_soft_failure() => {}
            other => panic!("Expected soft failure, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_timeout<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Timeout { .. }) => {}
            other => panic!("Expected Timeout, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_connectivity<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Connectivity { .. }) => {}
            other => panic!("Expected Connectivity error, got: {:?}", other),
        }
    }

    /// Assert that a CacheResult is a caller-contract violation.
    #[track_caller]
    pub fn assert_contract_violation<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Contract(_)) => {}
            other => panic!("Expected contract violation, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_valid(config: &CacheConfig) {
        if let Err(e) = config.validate() {
            panic!("Config validation failed: {:?}", e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_test_config_is_valid() {
        assertions::assert_config_valid(&fixtures::test_config());
    }

    #[tokio::test]
    async fn test_down_server_refuses_connect() {
        let connector = FaultyConnector::new();
        let address = ServerAddress::new("a", 1);
        connector.set_fault(&address, Fault::Down);
        assert!(connector.connect(&address).await.is_err());
        assert_eq!(connector.refused_connects(), 1);

        connector.clear_fault(&address);
        assert!(connector.connect(&address).await.is_ok());
    }

    #[tokio::test]
    async fn test_fault_applies_to_open_connection() {
        let connector = FaultyConnector::new();
        let address = ServerAddress::new("a", 1);
        let conn = connector.connect(&address).await.unwrap();
        assert!(conn.version().await.is_ok());

        connector.set_fault(&address, Fault::Down);
        assert!(matches!(conn.version().await, Err(StoreError::Io { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_never_answers() {
        let connector = FaultyConnector::new();
        let address = ServerAddress::new("a", 1);
        let conn = connector.connect(&address).await.unwrap();
        connector.set_fault(&address, Fault::Hang);

        let outcome = tokio::time::timeout(Duration::from_secs(5), conn.version()).await;
        assert!(outcome.is_err());
    }

    proptest! {
        #[test]
        fn prop_generated_configs_validate(config in generators::arb_valid_config()) {
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_generated_addresses_roundtrip(address in generators::arb_server_address()) {
            let parsed: ServerAddress = address.to_string().parse().unwrap();
            prop_assert_eq!(parsed, address);
        }
    }
}
