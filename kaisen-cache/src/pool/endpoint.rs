//! One server in the pool and its health state.

use crate::store::CacheConnection;
use kaisen_core::{EndpointHealth, ServerAddress};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A server endpoint: address, weight, pooled connections and a
/// consecutive-failure breaker.
///
/// Availability is a lock-free flag. It flips to unavailable when the
/// failure count reaches the threshold and back when the monitor installs
/// fresh connections.
pub struct Endpoint {
    address: ServerAddress,
    weight: u32,
    standby: Option<Arc<Endpoint>>,
    connections: RwLock<Vec<Arc<dyn CacheConnection>>>,
    next_connection: AtomicU64,
    available: AtomicBool,
    removed: AtomicBool,
    failure_count: AtomicU32,
    failure_threshold: u32,
}

impl Endpoint {
    pub(crate) fn new(
        address: ServerAddress,
        weight: u32,
        failure_threshold: u32,
        standby: Option<Arc<Endpoint>>,
    ) -> Self {
        Self {
            address,
            weight: weight.max(1),
            standby,
            connections: RwLock::new(Vec::new()),
            next_connection: AtomicU64::new(0),
            available: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            failure_count: AtomicU32::new(0),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn standby(&self) -> Option<&Arc<Endpoint>> {
        self.standby.as_ref()
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .map(|c| c.len())
            .unwrap_or_else(|e| e.into_inner().len())
    }

    /// Next pooled connection, round-robin. `None` while unavailable.
    pub(crate) fn connection(&self) -> Option<Arc<dyn CacheConnection>> {
        if !self.is_available() {
            return None;
        }
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        if connections.is_empty() {
            return None;
        }
        let idx = self.next_connection.fetch_add(1, Ordering::Relaxed) as usize;
        connections.get(idx % connections.len()).cloned()
    }

    pub(crate) fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
    }

    /// Count a timeout or I/O failure.
    ///
    /// Returns `true` for exactly one caller: the one whose failure took the
    /// endpoint from available to unavailable.
    pub(crate) fn record_failure(&self) -> bool {
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        count >= self.failure_threshold
            && self
                .available
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// Install fresh connections and mark the endpoint available.
    pub(crate) fn restore(&self, connections: Vec<Arc<dyn CacheConnection>>) {
        {
            let mut guard = self.connections.write().unwrap_or_else(|e| e.into_inner());
            *guard = connections;
        }
        self.failure_count.store(0, Ordering::SeqCst);
        self.available.store(true, Ordering::SeqCst);
    }

    /// Mark unavailable and hand back the connections so the caller can
    /// close them.
    pub(crate) fn take_connections(&self) -> Vec<Arc<dyn CacheConnection>> {
        self.available.store(false, Ordering::SeqCst);
        let mut guard = self.connections.write().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *guard)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
        if let Some(standby) = &self.standby {
            standby.removed.store(true, Ordering::SeqCst);
        }
    }

    /// `host:port (weight=N)`.
    pub fn description(&self) -> String {
        format!("{} (weight={})", self.address, self.weight)
    }

    /// Health snapshot from failure accounting alone.
    pub fn health(&self) -> EndpointHealth {
        let health = EndpointHealth::new(
            self.address.clone(),
            self.weight,
            self.is_available(),
            self.consecutive_failures(),
            self.connection_count(),
        );
        match &self.standby {
            Some(standby) => health.with_standby(standby.address.clone(), standby.is_available()),
            None => health,
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .field("weight", &self.weight)
            .field("available", &self.is_available())
            .field("failure_count", &self.consecutive_failures())
            .field("standby", &self.standby.as_ref().map(|s| s.address.clone()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryConnection, InMemoryStore};
    use kaisen_core::HealthStatus;

    fn conn() -> Arc<dyn CacheConnection> {
        Arc::new(InMemoryConnection::new(
            ServerAddress::new("a", 1),
            Arc::new(InMemoryStore::new()),
        ))
    }

    #[test]
    fn test_new_endpoint_is_unavailable_until_restored() {
        let ep = Endpoint::new(ServerAddress::new("a", 1), 1, 3, None);
        assert!(!ep.is_available());
        assert!(ep.connection().is_none());

        ep.restore(vec![conn()]);
        assert!(ep.is_available());
        assert!(ep.connection().is_some());
    }

    #[test]
    fn test_threshold_evicts_exactly_once() {
        let ep = Endpoint::new(ServerAddress::new("a", 1), 1, 3, None);
        ep.restore(vec![conn()]);

        assert!(!ep.record_failure());
        assert!(!ep.record_failure());
        assert!(ep.record_failure());
        assert!(!ep.record_failure());
        assert!(!ep.is_available());
    }

    #[test]
    fn test_success_resets_failures() {
        let ep = Endpoint::new(ServerAddress::new("a", 1), 1, 2, None);
        ep.restore(vec![conn()]);
        ep.record_failure();
        ep.record_success();
        assert!(!ep.record_failure());
        assert!(ep.is_available());
    }

    #[test]
    fn test_round_robin_over_pool() {
        let ep = Endpoint::new(ServerAddress::new("a", 1), 1, 3, None);
        let (a, b) = (conn(), conn());
        ep.restore(vec![a.clone(), b.clone()]);

        let first = ep.connection().unwrap();
        let second = ep.connection().unwrap();
        let third = ep.connection().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_description_and_health() {
        let ep = Endpoint::new(ServerAddress::new("cache", 11211), 3, 5, None);
        assert_eq!(ep.description(), "cache:11211 (weight=3)");
        assert_eq!(ep.health().status, HealthStatus::Unhealthy);

        ep.restore(vec![conn()]);
        assert_eq!(ep.health().status, HealthStatus::Healthy);
        assert_eq!(ep.health().connections, 1);
        ep.record_failure();
        let health = ep.health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.consecutive_failures, 1);
        assert_eq!(health.weight, 3);
        assert!(health.standby.is_none());
    }
}
