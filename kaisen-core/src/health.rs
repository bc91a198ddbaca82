//! Endpoint health reports
//!
//! One [`EndpointHealth`] per server in a pool, built from the endpoint's
//! failure accounting and, for available servers, a `version` round trip.
//! Everything is serde-serializable so applications can expose it as is.

use crate::ServerAddress;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coarse health of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Available, no failures since the last success
    Healthy,
    /// Available, but failing: consecutive failures below the eviction
    /// threshold, or the version round trip failed
    Degraded,
    /// Evicted and waiting for a reconnect
    Unhealthy,
}

impl HealthStatus {
    /// Status from the endpoint's availability and failure count.
    pub fn classify(available: bool, consecutive_failures: u32) -> Self {
        match (available, consecutive_failures) {
            (false, _) => Self::Unhealthy,
            (true, 0) => Self::Healthy,
            (true, _) => Self::Degraded,
        }
    }
}

/// Availability of an endpoint's standby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandbyHealth {
    pub server: ServerAddress,
    pub available: bool,
}

/// Health snapshot of one endpoint, primary or standby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub server: ServerAddress,
    pub weight: u32,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    /// Open connections in the endpoint's pool
    pub connections: usize,
    pub standby: Option<StandbyHealth>,
    /// Server version, when the round trip succeeded
    pub version: Option<String>,
    /// Version round trip in milliseconds
    pub round_trip_ms: Option<u64>,
    /// Why the version round trip failed
    pub error: Option<String>,
}

impl EndpointHealth {
    /// Snapshot from the endpoint's own accounting, before any round trip.
    pub fn new(
        server: ServerAddress,
        weight: u32,
        available: bool,
        consecutive_failures: u32,
        connections: usize,
    ) -> Self {
        Self {
            server,
            weight,
            status: HealthStatus::classify(available, consecutive_failures),
            consecutive_failures,
            connections,
            standby: None,
            version: None,
            round_trip_ms: None,
            error: None,
        }
    }

    pub fn with_standby(mut self, server: ServerAddress, available: bool) -> Self {
        self.standby = Some(StandbyHealth { server, available });
        self
    }

    /// Record a successful version round trip.
    pub fn answered(mut self, version: impl Into<String>, round_trip: Duration) -> Self {
        self.version = Some(version.into());
        self.round_trip_ms = Some(u64::try_from(round_trip.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Record a failed version round trip. An available endpoint that cannot
    /// answer is degraded, never healthy.
    pub fn unanswered(mut self, reason: impl Into<String>) -> Self {
        if self.status == HealthStatus::Healthy {
            self.status = HealthStatus::Degraded;
        }
        self.error = Some(reason.into());
        self
    }

    /// Whether the endpoint currently takes traffic.
    pub fn is_serving(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}
