//! Pool state listeners.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kaisen_core::{CacheResult, ServerAddress};
use std::sync::Arc;

/// Emitted when an endpoint connects, is evicted or is removed.
#[derive(Debug, Clone)]
pub struct EndpointEvent {
    /// Name of the pool's client
    pub client: String,
    pub server: ServerAddress,
    pub timestamp: DateTime<Utc>,
}

/// Emitted once when the pool shuts down.
#[derive(Debug, Clone)]
pub struct ShutdownEvent {
    pub client: String,
    pub timestamp: DateTime<Utc>,
}

/// Observer of pool state changes.
#[async_trait]
pub trait PoolStateListener: Send + Sync {
    async fn on_connected(&self, _event: EndpointEvent) -> CacheResult<()> {
        Ok(())
    }

    async fn on_disconnected(&self, _event: EndpointEvent) -> CacheResult<()> {
        Ok(())
    }

    async fn on_shutdown(&self, _event: ShutdownEvent) -> CacheResult<()> {
        Ok(())
    }
}

/// Chain of state listeners. A failing listener is logged and skipped.
#[derive(Default)]
pub struct ListenerChain {
    listeners: Vec<Arc<dyn PoolStateListener>>,
}

impl ListenerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn PoolStateListener>) {
        self.listeners.push(listener);
    }

    /// Remove `listener` (compared by identity). Returns `false` if absent.
    pub fn remove(&mut self, listener: &Arc<dyn PoolStateListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let before = self.listeners.len();
        self.listeners.retain(|l| Arc::as_ptr(l) as *const () != target);
        self.listeners.len() != before
    }

    pub fn listeners(&self) -> Vec<Arc<dyn PoolStateListener>> {
        self.listeners.clone()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub async fn emit_connected(&self, event: EndpointEvent) {
        for (idx, listener) in self.listeners.iter().enumerate() {
            if let Err(e) = listener.on_connected(event.clone()).await {
                tracing::warn!(
                    listener_index = idx,
                    server = %event.server,
                    error = %e,
                    "Pool connected listener failed"
                );
            }
        }
    }

    pub async fn emit_disconnected(&self, event: EndpointEvent) {
        for (idx, listener) in self.listeners.iter().enumerate() {
            if let Err(e) = listener.on_disconnected(event.clone()).await {
                tracing::warn!(
                    listener_index = idx,
                    server = %event.server,
                    error = %e,
                    "Pool disconnected listener failed"
                );
            }
        }
    }

    pub async fn emit_shutdown(&self, event: ShutdownEvent) {
        for (idx, listener) in self.listeners.iter().enumerate() {
            if let Err(e) = listener.on_shutdown(event.clone()).await {
                tracing::warn!(
                    listener_index = idx,
                    error = %e,
                    "Pool shutdown listener failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for ListenerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerChain")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
