//! Reconnect scheduling.
//!
//! Evicted endpoints and endpoints whose first connect failed are queued
//! here. A background task started by the pool drains due requests on every
//! heal interval; callers never wait on it.

use super::endpoint::Endpoint;
use super::ServerPool;
use kaisen_core::ServerAddress;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A pending reconnect for one endpoint.
#[derive(Debug, Clone)]
pub struct ReconnectRequest {
    pub address: ServerAddress,
    /// Failed reconnect attempts so far
    pub attempts: u32,
    pub next_attempt: Instant,
    pub(crate) endpoint: Arc<Endpoint>,
}

#[derive(Debug, Default)]
pub(crate) struct ReconnectQueue {
    requests: Mutex<VecDeque<ReconnectRequest>>,
}

impl ReconnectQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<ReconnectRequest>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a first attempt. An endpoint already queued is left alone.
    pub(crate) fn push(&self, endpoint: &Arc<Endpoint>, next_attempt: Instant) -> bool {
        let mut requests = self.lock();
        if requests.iter().any(|r| Arc::ptr_eq(&r.endpoint, endpoint)) {
            return false;
        }
        requests.push_back(ReconnectRequest {
            address: endpoint.address().clone(),
            attempts: 0,
            next_attempt,
            endpoint: Arc::clone(endpoint),
        });
        true
    }

    pub(crate) fn requeue(&self, request: ReconnectRequest) {
        self.lock().push_back(request);
    }

    /// Remove and return requests whose time has come.
    pub(crate) fn take_due(&self, now: Instant) -> Vec<ReconnectRequest> {
        let mut requests = self.lock();
        let (due, waiting): (Vec<_>, Vec<_>) =
            requests.drain(..).partition(|r| r.next_attempt <= now);
        requests.extend(waiting);
        due
    }

    pub(crate) fn take_all(&self) -> Vec<ReconnectRequest> {
        self.lock().drain(..).collect()
    }

    pub(crate) fn remove(&self, endpoint: &Arc<Endpoint>) {
        self.lock().retain(|r| !Arc::ptr_eq(&r.endpoint, endpoint));
    }

    pub(crate) fn snapshot(&self) -> Vec<ReconnectRequest> {
        self.lock().iter().cloned().collect()
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }
}

/// Start the heal loop for `pool` on the current runtime.
///
/// Returns `None` when called outside a tokio runtime. The task holds only a
/// weak reference and exits once the pool is dropped or shut down.
pub(crate) fn spawn_heal_task(pool: Weak<ServerPool>, interval: Duration) -> Option<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };
            if pool.is_shutdown() {
                break;
            }
            let healed = pool.heal_due().await;
            if healed > 0 {
                tracing::debug!(client = %pool.name(), healed, "heal pass finished");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> Arc<Endpoint> {
        Arc::new(Endpoint::new(ServerAddress::new("a", port), 1, 1, None))
    }

    #[test]
    fn test_push_dedupes_endpoint() {
        let queue = ReconnectQueue::default();
        let ep = endpoint(1);
        assert!(queue.push(&ep, Instant::now()));
        assert!(!queue.push(&ep, Instant::now()));
        assert_eq!(queue.snapshot().len(), 1);
    }

    #[test]
    fn test_take_due_leaves_future_requests() {
        let queue = ReconnectQueue::default();
        let now = Instant::now();
        queue.push(&endpoint(1), now);
        queue.push(&endpoint(2), now + Duration::from_secs(60));

        let due = queue.take_due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].address.port, 1);
        assert_eq!(queue.snapshot().len(), 1);
        assert_eq!(queue.take_all().len(), 1);
        assert!(queue.snapshot().is_empty());
    }

    #[test]
    fn test_remove_drops_endpoint() {
        let queue = ReconnectQueue::default();
        let ep = endpoint(1);
        queue.push(&ep, Instant::now());
        queue.remove(&ep);
        assert!(queue.snapshot().is_empty());
    }
}
