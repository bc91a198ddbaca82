//! Get merging.
//!
//! Single-key gets routed to the same endpoint are queued on that
//! endpoint's worker. The worker drains whatever has queued up (at most
//! `merge_factor` distinct keys), sends one multi-get and answers every
//! waiter from the combined reply. A failed round trip fails every waiter in
//! the batch with the same error.

use crate::deadline::Deadline;
use crate::pool::Endpoint;
use dashmap::DashMap;
use kaisen_core::{CacheError, CacheResult, CachedData, ServerAddress};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

struct PendingGet {
    key: String,
    deadline: Deadline,
    reply: oneshot::Sender<CacheResult<Option<CachedData>>>,
}

pub(crate) struct GetBatcher {
    merge_factor: usize,
    merge_window: Duration,
    queues: DashMap<ServerAddress, mpsc::UnboundedSender<PendingGet>>,
}

impl GetBatcher {
    pub(crate) fn new(merge_factor: usize, merge_window: Duration) -> Self {
        Self {
            merge_factor: merge_factor.max(1),
            merge_window,
            queues: DashMap::new(),
        }
    }

    /// Queue a get and wait for its share of the merged reply, at most
    /// until `deadline`.
    pub(crate) async fn get(
        &self,
        endpoint: &Arc<Endpoint>,
        key: String,
        deadline: Deadline,
    ) -> CacheResult<Option<CachedData>> {
        let (reply, rx) = oneshot::channel();
        let pending = PendingGet {
            key,
            deadline,
            reply,
        };

        if let Err(mpsc::error::SendError(pending)) = self.sender(endpoint).send(pending) {
            // The worker for this address is gone; start a fresh one.
            self.queues.remove(endpoint.address());
            self.sender(endpoint)
                .send(pending)
                .map_err(|_| CacheError::Interrupted { operation: "get" })?;
        }

        match tokio::time::timeout_at(deadline.at(), rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => Err(CacheError::Interrupted { operation: "get" }),
            Err(_) => Err(deadline.expired("get")),
        }
    }

    /// Stop merging for an endpoint. Its worker exits once drained.
    pub(crate) fn remove(&self, address: &ServerAddress) {
        self.queues.remove(address);
    }

    pub(crate) fn clear(&self) {
        self.queues.clear();
    }

    pub(crate) fn active_queues(&self) -> usize {
        self.queues.len()
    }

    fn sender(&self, endpoint: &Arc<Endpoint>) -> mpsc::UnboundedSender<PendingGet> {
        self.queues
            .entry(endpoint.address().clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_worker(
                    Arc::clone(endpoint),
                    rx,
                    self.merge_factor,
                    self.merge_window,
                ));
                tx
            })
            .clone()
    }
}

async fn run_worker(
    endpoint: Arc<Endpoint>,
    mut rx: mpsc::UnboundedReceiver<PendingGet>,
    merge_factor: usize,
    merge_window: Duration,
) {
    while let Some(first) = rx.recv().await {
        if !merge_window.is_zero() {
            tokio::time::sleep(merge_window).await;
        }

        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut deadline = first.deadline.at();
        let mut timeout = first.deadline.timeout();
        seen.insert(first.key.clone());
        keys.push(first.key.clone());
        let mut batch = vec![first];

        while seen.len() < merge_factor {
            let Ok(next) = rx.try_recv() else {
                break;
            };
            if seen.insert(next.key.clone()) {
                keys.push(next.key.clone());
            }
            deadline = deadline.max(next.deadline.at());
            timeout = timeout.max(next.deadline.timeout());
            batch.push(next);
        }

        let result = fetch(&endpoint, &keys, deadline, timeout).await;
        tracing::trace!(
            server = %endpoint.address(),
            keys = keys.len(),
            waiters = batch.len(),
            ok = result.is_ok(),
            "merged get dispatched"
        );

        for pending in batch {
            let answer = match &result {
                Ok(found) => Ok(found.get(&pending.key).cloned()),
                Err(e) => Err(e.clone()),
            };
            // The waiter may already have timed out.
            let _ = pending.reply.send(answer);
        }
    }
}

async fn fetch(
    endpoint: &Endpoint,
    keys: &[String],
    deadline: Instant,
    timeout: Duration,
) -> CacheResult<HashMap<String, CachedData>> {
    let connection = endpoint.connection().ok_or_else(|| CacheError::Connectivity {
        reason: format!("{} is unavailable", endpoint.address()),
    })?;

    match tokio::time::timeout_at(deadline, connection.get_multi(keys)).await {
        Ok(found) => Ok(found?),
        Err(_) => Err(CacheError::Timeout {
            operation: "get",
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryConnector;
    use crate::store::Connector;

    async fn endpoint(connector: &InMemoryConnector) -> Arc<Endpoint> {
        let address = ServerAddress::new("mem", 1);
        let ep = Arc::new(Endpoint::new(address.clone(), 1, 10, None));
        ep.restore(vec![connector.connect(&address).await.unwrap()]);
        ep
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_round_trip() {
        let connector = InMemoryConnector::new();
        let ep = endpoint(&connector).await;
        let conn = ep.connection().unwrap();
        conn.set("a", CachedData::new(0, b"1".to_vec()), 0).await.unwrap();
        conn.set("c", CachedData::new(0, b"3".to_vec()), 0).await.unwrap();

        let batcher = GetBatcher::new(150, Duration::ZERO);
        let deadline = Deadline::after(Duration::from_secs(1));
        let (a, b, c, a2) = tokio::join!(
            batcher.get(&ep, "a".to_string(), deadline),
            batcher.get(&ep, "b".to_string(), deadline),
            batcher.get(&ep, "c".to_string(), deadline),
            batcher.get(&ep, "a".to_string(), deadline),
        );

        assert_eq!(a.unwrap().unwrap().data, b"1");
        assert!(b.unwrap().is_none());
        assert_eq!(c.unwrap().unwrap().data, b"3");
        assert_eq!(a2.unwrap().unwrap().data, b"1");
        assert_eq!(connector.call_count("get_multi"), 1);
    }

    #[tokio::test]
    async fn test_merge_factor_splits_batches() {
        let connector = InMemoryConnector::new();
        let ep = endpoint(&connector).await;

        let batcher = GetBatcher::new(2, Duration::ZERO);
        let deadline = Deadline::after(Duration::from_secs(1));
        let (a, b, c) = tokio::join!(
            batcher.get(&ep, "a".to_string(), deadline),
            batcher.get(&ep, "b".to_string(), deadline),
            batcher.get(&ep, "c".to_string(), deadline),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(connector.call_count("get_multi"), 2);
    }

    #[tokio::test]
    async fn test_unavailable_endpoint_fails_every_waiter() {
        let ep = Arc::new(Endpoint::new(ServerAddress::new("down", 1), 1, 10, None));
        let batcher = GetBatcher::new(150, Duration::ZERO);
        let deadline = Deadline::after(Duration::from_secs(1));
        let (a, b) = tokio::join!(
            batcher.get(&ep, "a".to_string(), deadline),
            batcher.get(&ep, "b".to_string(), deadline),
        );
        assert!(matches!(a, Err(CacheError::Connectivity { .. })));
        assert!(matches!(b, Err(CacheError::Connectivity { .. })));
    }

    #[tokio::test]
    async fn test_removed_queue_restarts_worker() {
        let connector = InMemoryConnector::new();
        let ep = endpoint(&connector).await;
        let batcher = GetBatcher::new(150, Duration::ZERO);

        batcher
            .get(&ep, "a".to_string(), Deadline::after(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(batcher.active_queues(), 1);
        batcher.remove(ep.address());
        assert_eq!(batcher.active_queues(), 0);
        batcher
            .get(&ep, "a".to_string(), Deadline::after(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(batcher.active_queues(), 1);
    }
}
