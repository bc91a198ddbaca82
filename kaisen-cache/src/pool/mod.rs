//! Server pool.
//!
//! The pool owns every endpoint, the continuum that maps keys onto them, the
//! get batcher and the reconnect queue. Facades share one pool through an
//! `Arc`; they route a wire key, run their call on the chosen endpoint's
//! connection and report the outcome back so the endpoint's breaker can
//! count consecutive failures.
//!
//! Topology changes (`add_server`, `remove_server`) are serialized and
//! complete before returning. The continuum is swapped in as a new snapshot,
//! so routing never waits on a topology change.

mod endpoint;
mod listener;
mod monitor;
mod ring;

pub use endpoint::Endpoint;
pub use listener::{EndpointEvent, ListenerChain, PoolStateListener, ShutdownEvent};
pub use monitor::ReconnectRequest;

use crate::batch::GetBatcher;
use crate::deadline::Deadline;
use crate::store::{CacheConnection, Connector};
use chrono::Utc;
use kaisen_core::{
    parse_server_list, CacheConfig, CacheError, CacheResult, CachedData, EndpointHealth,
    ServerAddress, ServerSpec,
};
use monitor::ReconnectQueue;
use ring::Continuum;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::RwLock as TokioRwLock;
use tokio::task::JoinHandle;

/// Pool of cache servers shared by every facade built on it.
pub struct ServerPool {
    config: CacheConfig,
    connector: Arc<dyn Connector>,
    endpoints: TokioRwLock<Vec<Arc<Endpoint>>>,
    continuum: RwLock<Arc<Continuum>>,
    batcher: GetBatcher,
    reconnects: ReconnectQueue,
    listeners: Arc<TokioRwLock<ListenerChain>>,
    heal_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl ServerPool {
    /// Create an empty pool.
    ///
    /// When called inside a tokio runtime with `enable_heal_session` on, the
    /// background reconnect task starts immediately.
    pub fn new(config: CacheConfig, connector: Arc<dyn Connector>) -> CacheResult<Arc<Self>> {
        config.validate()?;

        let pool = Arc::new(Self {
            batcher: GetBatcher::new(config.merge_factor, config.merge_window),
            continuum: RwLock::new(Arc::new(Continuum::empty(config.key_distribution))),
            config,
            connector,
            endpoints: TokioRwLock::new(Vec::new()),
            reconnects: ReconnectQueue::default(),
            listeners: Arc::new(TokioRwLock::new(ListenerChain::new())),
            heal_task: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });

        if pool.config.enable_heal_session {
            match monitor::spawn_heal_task(Arc::downgrade(&pool), pool.config.heal_interval) {
                Some(handle) => {
                    *pool.heal_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                }
                None => tracing::debug!(
                    client = %pool.config.name,
                    "no tokio runtime, background reconnects disabled"
                ),
            }
        }

        Ok(pool)
    }

    /// Create a pool and add a whitespace separated server list.
    pub async fn connect(
        config: CacheConfig,
        connector: Arc<dyn Connector>,
        servers: &str,
    ) -> CacheResult<Arc<Self>> {
        let pool = Self::new(config, connector)?;
        pool.add_servers(servers).await?;
        Ok(pool)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub async fn add_listener(&self, listener: Arc<dyn PoolStateListener>) {
        self.listeners.write().await.add(listener);
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub async fn remove_listener(&self, listener: &Arc<dyn PoolStateListener>) -> bool {
        self.listeners.write().await.remove(listener)
    }

    /// Registered listeners, in registration order.
    pub async fn listeners(&self) -> Vec<Arc<dyn PoolStateListener>> {
        self.listeners.read().await.listeners()
    }

    // ------------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------------

    /// Add a server with a weight.
    pub async fn add_server(&self, address: ServerAddress, weight: u32) -> CacheResult<()> {
        self.add_server_spec(ServerSpec::new(address).with_weight(weight))
            .await
    }

    /// Add every entry of a `host:port[,standby:port] ...` list.
    pub async fn add_servers(&self, servers: &str) -> CacheResult<()> {
        for spec in parse_server_list(servers)? {
            self.add_server_spec(spec).await?;
        }
        Ok(())
    }

    /// Add one server (and its standby).
    ///
    /// Returns once the server is registered. If the first connect fails the
    /// server is still registered, marked unavailable and queued for
    /// reconnection. Adding an address that is already present is a no-op.
    /// Weights above [`MAX_SERVER_WEIGHT`](kaisen_core::MAX_SERVER_WEIGHT)
    /// are rejected.
    pub async fn add_server_spec(&self, spec: ServerSpec) -> CacheResult<()> {
        self.ensure_running()?;
        spec.validate()?;
        let mut endpoints = self.endpoints.write().await;

        if endpoints.iter().any(|ep| ep.address() == &spec.address) {
            tracing::warn!(server = %spec.address, "server already in pool, ignoring add");
            return Ok(());
        }

        let standby = match spec.standby {
            Some(address) => {
                let standby = Arc::new(Endpoint::new(
                    address,
                    spec.weight,
                    self.config.failure_threshold,
                    None,
                ));
                self.open_endpoint(&standby).await;
                Some(standby)
            }
            None => None,
        };

        let endpoint = Arc::new(Endpoint::new(
            spec.address,
            spec.weight,
            self.config.failure_threshold,
            standby,
        ));
        self.open_endpoint(&endpoint).await;

        endpoints.push(endpoint);
        self.rebuild(&endpoints);
        Ok(())
    }

    /// Remove a server and its standby. Returns `false` if it was not present.
    pub async fn remove_server(&self, address: &ServerAddress) -> bool {
        let removed = {
            let mut endpoints = self.endpoints.write().await;
            let Some(pos) = endpoints.iter().position(|ep| ep.address() == address) else {
                return false;
            };
            let removed = endpoints.remove(pos);
            self.rebuild(&endpoints);
            removed
        };

        removed.mark_removed();
        for ep in std::iter::once(&removed).chain(removed.standby()) {
            self.reconnects.remove(ep);
            self.batcher.remove(ep.address());
            close_all(ep.take_connections(), self.config.op_timeout).await;
        }

        tracing::info!(client = %self.config.name, server = %address, "server removed");
        self.listeners
            .read()
            .await
            .emit_disconnected(self.event(address))
            .await;
        true
    }

    /// Remove every server in a whitespace separated list. Standby parts are
    /// ignored. Returns how many servers were removed.
    pub async fn remove_servers(&self, servers: &str) -> CacheResult<usize> {
        let mut removed = 0;
        for spec in parse_server_list(servers)? {
            if self.remove_server(&spec.address).await {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Every configured primary server.
    pub fn servers(&self) -> Vec<ServerAddress> {
        self.snapshot()
            .endpoints()
            .iter()
            .map(|ep| ep.address().clone())
            .collect()
    }

    /// Primary servers currently available.
    pub fn available_servers(&self) -> Vec<ServerAddress> {
        self.snapshot()
            .endpoints()
            .iter()
            .filter(|ep| ep.is_available())
            .map(|ep| ep.address().clone())
            .collect()
    }

    /// `host:port (weight=N)` for every primary server.
    pub fn servers_description(&self) -> Vec<String> {
        self.snapshot()
            .endpoints()
            .iter()
            .map(|ep| ep.description())
            .collect()
    }

    /// Health of every primary and standby endpoint.
    ///
    /// Available endpoints are probed with a `version` call bounded by the
    /// operation timeout.
    pub async fn servers_health(&self) -> Vec<EndpointHealth> {
        let mut reports = Vec::new();
        for ep in self.all_endpoints() {
            let health = ep.health();
            let Some(connection) = ep.connection() else {
                reports.push(health);
                continue;
            };

            let started = Instant::now();
            let health = match tokio::time::timeout(self.config.op_timeout, connection.version())
                .await
            {
                Ok(Ok(version)) => health.answered(version, started.elapsed()),
                Ok(Err(e)) => health.unanswered(e.to_string()),
                Err(_) => health.unanswered("version call timed out"),
            };
            reports.push(health);
        }
        reports
    }

    /// Reconnects waiting to run.
    pub fn pending_reconnects(&self) -> Vec<ReconnectRequest> {
        self.reconnects.snapshot()
    }

    // ------------------------------------------------------------------------
    // Reconnects
    // ------------------------------------------------------------------------

    /// Attempt every queued reconnect now, ignoring schedules.
    /// Returns the number of endpoints restored.
    pub async fn heal_now(&self) -> usize {
        let requests = self.reconnects.take_all();
        self.heal(requests).await
    }

    /// Attempt the reconnects whose time has come.
    pub async fn heal_due(&self) -> usize {
        let requests = self.reconnects.take_due(Instant::now());
        self.heal(requests).await
    }

    async fn heal(&self, requests: Vec<ReconnectRequest>) -> usize {
        let mut healed = 0;
        for mut request in requests {
            if self.is_shutdown() || request.endpoint.is_removed() {
                continue;
            }
            if request.endpoint.is_available() {
                continue;
            }

            tracing::debug!(
                server = %request.address,
                attempt = request.attempts + 1,
                "reconnecting"
            );
            match self.open_connections(&request.address).await {
                Ok(connections) if request.endpoint.is_removed() || self.is_shutdown() => {
                    // Removed while connecting.
                    close_all(connections, self.config.op_timeout).await;
                }
                Ok(connections) => {
                    request.endpoint.restore(connections);
                    healed += 1;
                    tracing::info!(
                        client = %self.config.name,
                        server = %request.address,
                        attempts = request.attempts + 1,
                        "server reconnected"
                    );
                    self.listeners
                        .read()
                        .await
                        .emit_connected(self.event(&request.address))
                        .await;
                }
                Err(e) => {
                    request.attempts += 1;
                    request.next_attempt = Instant::now() + self.config.heal_interval;
                    tracing::debug!(
                        server = %request.address,
                        attempts = request.attempts,
                        error = %e,
                        "reconnect failed"
                    );
                    self.reconnects.requeue(request);
                }
            }
        }
        healed
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Close every connection and stop background work.
    ///
    /// Every later operation on a facade using this pool is a soft failure.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self
            .heal_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        self.batcher.clear();
        self.reconnects.clear();
        for ep in self.all_endpoints() {
            close_all(ep.take_connections(), self.config.op_timeout).await;
        }

        tracing::info!(client = %self.config.name, "pool shut down");
        self.listeners
            .read()
            .await
            .emit_shutdown(ShutdownEvent {
                client: self.config.name.clone(),
                timestamp: Utc::now(),
            })
            .await;
    }

    // ------------------------------------------------------------------------
    // Routing (used by the facade)
    // ------------------------------------------------------------------------

    /// Pick the endpoint serving `key`.
    ///
    /// With failure mode on, the key's own server is used while available,
    /// then its standby, otherwise the call fails fast. With failure mode off,
    /// unavailable servers are skipped on the continuum.
    pub(crate) fn route(&self, key: &str) -> CacheResult<Arc<Endpoint>> {
        self.ensure_running()?;
        let ring = self.snapshot();
        if ring.is_empty() {
            return Err(CacheError::Connectivity {
                reason: "no servers configured".to_string(),
            });
        }

        if self.config.failure_mode {
            let primary = ring.primary(key).ok_or_else(|| CacheError::Connectivity {
                reason: "no servers configured".to_string(),
            })?;
            if primary.is_available() {
                return Ok(Arc::clone(primary));
            }
            return match primary.standby() {
                Some(standby) if standby.is_available() => {
                    tracing::debug!(
                        server = %primary.address(),
                        standby = %standby.address(),
                        "routing to standby"
                    );
                    Ok(Arc::clone(standby))
                }
                _ => Err(CacheError::Connectivity {
                    reason: format!("{} is unavailable", primary.address()),
                }),
            };
        }

        ring.select(key, Endpoint::is_available)
            .cloned()
            .ok_or_else(|| CacheError::Connectivity {
                reason: "no available servers".to_string(),
            })
    }

    /// A connection on `endpoint`, failing if it went away since routing.
    pub(crate) fn connection(&self, endpoint: &Endpoint) -> CacheResult<Arc<dyn CacheConnection>> {
        endpoint.connection().ok_or_else(|| CacheError::Connectivity {
            reason: format!("{} is unavailable", endpoint.address()),
        })
    }

    /// Merged single-key get, or a direct one when merging is off.
    pub(crate) async fn get_one(
        &self,
        endpoint: &Arc<Endpoint>,
        key: String,
        deadline: Deadline,
    ) -> CacheResult<Option<CachedData>> {
        if self.config.optimize_get {
            return self.batcher.get(endpoint, key, deadline).await;
        }
        let connection = self.connection(endpoint)?;
        let keys = [key];
        let mut found = deadline.bound("get", connection.get_multi(&keys)).await?;
        Ok(found.remove(&keys[0]))
    }

    /// Feed a call's outcome into the endpoint's breaker.
    pub(crate) fn record<T>(&self, endpoint: &Arc<Endpoint>, result: &CacheResult<T>) {
        match result {
            Ok(_) => endpoint.record_success(),
            Err(e) if e.counts_against_endpoint() => {
                if endpoint.record_failure() {
                    self.evict(endpoint, e);
                }
            }
            Err(_) => {}
        }
    }

    /// Available endpoints, primaries and standbys, for fan-out commands.
    pub(crate) fn live_endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.all_endpoints()
            .into_iter()
            .filter(|ep| ep.is_available())
            .collect()
    }

    /// Look up a primary or standby endpoint by address.
    pub(crate) fn endpoint(&self, address: &ServerAddress) -> Option<Arc<Endpoint>> {
        self.all_endpoints()
            .into_iter()
            .find(|ep| ep.address() == address)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn ensure_running(&self) -> CacheResult<()> {
        if self.is_shutdown() {
            return Err(CacheError::Connectivity {
                reason: format!("pool {} is shut down", self.config.name),
            });
        }
        Ok(())
    }

    fn snapshot(&self) -> Arc<Continuum> {
        Arc::clone(&self.continuum.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn rebuild(&self, endpoints: &[Arc<Endpoint>]) {
        let ring = Arc::new(Continuum::build(
            self.config.key_distribution,
            endpoints.to_vec(),
        ));
        *self.continuum.write().unwrap_or_else(|e| e.into_inner()) = ring;
    }

    fn all_endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.snapshot()
            .endpoints()
            .iter()
            .flat_map(|ep| std::iter::once(ep).chain(ep.standby()))
            .cloned()
            .collect()
    }

    fn event(&self, server: &ServerAddress) -> EndpointEvent {
        EndpointEvent {
            client: self.config.name.clone(),
            server: server.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Open `pool_size` connections, each bounded by the connect timeout.
    async fn open_connections(
        &self,
        address: &ServerAddress,
    ) -> CacheResult<Vec<Arc<dyn CacheConnection>>> {
        let mut connections = Vec::with_capacity(self.config.pool_size);
        for _ in 0..self.config.pool_size {
            let outcome =
                tokio::time::timeout(self.config.connect_timeout, self.connector.connect(address))
                    .await;
            let failure = match outcome {
                Ok(Ok(connection)) => {
                    connections.push(connection);
                    continue;
                }
                Ok(Err(e)) => CacheError::from(e),
                Err(_) => CacheError::Timeout {
                    operation: "connect",
                    timeout: self.config.connect_timeout,
                },
            };
            close_all(connections, self.config.op_timeout).await;
            return Err(failure);
        }
        Ok(connections)
    }

    /// First connect of a newly added endpoint.
    async fn open_endpoint(&self, endpoint: &Arc<Endpoint>) {
        match self.open_connections(endpoint.address()).await {
            Ok(connections) => {
                endpoint.restore(connections);
                tracing::info!(
                    client = %self.config.name,
                    server = %endpoint.address(),
                    weight = endpoint.weight(),
                    "server connected"
                );
                self.listeners
                    .read()
                    .await
                    .emit_connected(self.event(endpoint.address()))
                    .await;
            }
            Err(e) => {
                tracing::warn!(
                    client = %self.config.name,
                    server = %endpoint.address(),
                    error = %e,
                    "initial connect failed, queued for reconnect"
                );
                self.reconnects
                    .push(endpoint, Instant::now() + self.config.heal_interval);
            }
        }
    }

    /// Take an endpoint out of rotation. Connection teardown and listeners
    /// run on a background task so the failing caller returns at once.
    fn evict(&self, endpoint: &Arc<Endpoint>, cause: &CacheError) {
        tracing::warn!(
            client = %self.config.name,
            server = %endpoint.address(),
            threshold = self.config.failure_threshold,
            error = %cause,
            "server evicted after consecutive failures"
        );

        let connections = endpoint.take_connections();
        self.batcher.remove(endpoint.address());

        if !endpoint.is_removed() && !self.is_shutdown() {
            self.reconnects
                .push(endpoint, Instant::now() + self.config.heal_interval);
        }

        let op_timeout = self.config.op_timeout;
        let listeners = Arc::clone(&self.listeners);
        let event = self.event(endpoint.address());
        tokio::spawn(async move {
            close_all(connections, op_timeout).await;
            listeners.read().await.emit_disconnected(event).await;
        });
    }
}

impl std::fmt::Debug for ServerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPool")
            .field("name", &self.config.name)
            .field("servers", &self.servers_description())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

async fn close_all(connections: Vec<Arc<dyn CacheConnection>>, timeout: Duration) {
    for connection in connections {
        match tokio::time::timeout(timeout, connection.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "closing connection failed"),
            Err(_) => tracing::debug!("closing connection timed out"),
        }
    }
}
