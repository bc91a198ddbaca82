//! Check-and-set retry loop.
//!
//! [`Cache::try_cas_with`] makes exactly one read-modify-write attempt. This
//! combinator repeats it until the write wins, the key disappears or the
//! attempt budget runs out.

use crate::client::Cache;
use crate::codec::ValueCodec;
use kaisen_core::{CacheResult, CasOutcome, OpOptions};

/// Apply `f` to the value at `key` until the write is not beaten by a
/// concurrent writer.
///
/// `f` is called once per attempt with a fresh read, so it must not have
/// side effects that cannot repeat. Returns [`CasOutcome::Conflict`] when
/// every attempt lost, [`CasOutcome::NotFound`] when the key is missing.
/// Failures end the loop immediately.
pub async fn retry_cas<T, C, F>(
    cache: &Cache<T, C>,
    key: &str,
    attempts: usize,
    mut f: F,
    opts: OpOptions,
) -> CacheResult<CasOutcome>
where
    T: Send + Sync + 'static,
    C: ValueCodec<T> + 'static,
    F: FnMut(T) -> T,
{
    for attempt in 1..=attempts {
        match cache.try_cas_with(key, &mut f, opts).await? {
            CasOutcome::Conflict => {
                tracing::debug!(key, attempt, "cas conflict, retrying");
            }
            outcome => return Ok(outcome),
        }
    }
    Ok(CasOutcome::Conflict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryConnector;
    use crate::pool::ServerPool;
    use kaisen_core::CacheConfig;
    use std::sync::Arc;

    async fn cache() -> Cache<u64> {
        let pool = ServerPool::connect(
            CacheConfig::new().with_heal_session(false),
            Arc::new(InMemoryConnector::new()),
            "mem:1",
        )
        .await
        .unwrap();
        Cache::new(pool, "cas").unwrap()
    }

    #[tokio::test]
    async fn test_retry_cas_applies_update() {
        let cache = cache().await;
        assert!(cache.set("n", &1, OpOptions::new()).await);
        let outcome = retry_cas(&cache, "n", 3, |n| n + 1, OpOptions::new())
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Stored);
        assert_eq!(cache.get("n", OpOptions::new()).await, Some(2));
    }

    #[tokio::test]
    async fn test_retry_cas_missing_key() {
        let cache = cache().await;
        let mut calls = 0;
        let outcome = retry_cas(
            &cache,
            "missing",
            3,
            |n| {
                calls += 1;
                n
            },
            OpOptions::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, CasOutcome::NotFound);
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_retry_cas_gives_up() {
        let cache = cache().await;
        assert_eq!(
            retry_cas(&cache, "n", 0, |n| n, OpOptions::new())
                .await
                .unwrap(),
            CasOutcome::Conflict
        );
    }
}
