//! Per-call time budget.
//!
//! One facade call may need several round trips (namespace token lookup,
//! token creation, the call itself). They all draw on the same deadline, so
//! the call as a whole never waits longer than its operation timeout.

use crate::store::StoreResult;
use kaisen_core::{CacheError, CacheResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    /// A budget of `timeout` starting now.
    pub(crate) fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    pub(crate) fn at(&self) -> Instant {
        self.at
    }

    /// The full budget, reported in timeout errors.
    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn expired(&self, operation: &'static str) -> CacheError {
        CacheError::Timeout {
            operation,
            timeout: self.timeout,
        }
    }

    /// Run a store call, failing with a timeout once the deadline passes.
    pub(crate) async fn bound<R>(
        &self,
        operation: &'static str,
        call: impl Future<Output = StoreResult<R>>,
    ) -> CacheResult<R> {
        match tokio::time::timeout_at(self.at, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(self.expired(operation)),
        }
    }
}
