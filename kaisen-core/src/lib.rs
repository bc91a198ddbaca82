//! Kaisen Core - Cache Data Types
//!
//! Pure data structures shared by the cache layer: server addresses, value
//! payloads, operation options, CAS results, statistics, configuration and
//! the error taxonomy. This crate performs no I/O.

pub mod config;
pub mod constants;
pub mod error;
pub mod health;

pub use config::{CacheConfig, CacheConfigFile, KeyDistribution};
pub use constants::*;
pub use error::{CacheError, CacheResult, CodecError, ConfigError, ContractViolation, StoreError};
pub use health::{EndpointHealth, HealthStatus, StandbyHealth};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Version of a namespace token. UUIDv7 so successive versions sort by time.
pub type NamespaceVersion = Uuid;

/// Server compare token returned by `gets`.
pub type CasToken = u64;

/// Raw `stats` reply of one server.
pub type ServerStats = HashMap<String, String>;

/// Generate a fresh namespace version.
pub fn new_namespace_version() -> NamespaceVersion {
    Uuid::now_v7()
}

// ============================================================================
// SERVER ADDRESSES
// ============================================================================

/// Address of one remote cache server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port` or `[v6addr]:port`.
    ///
    /// A missing port defaults to [`DEFAULT_PORT`].
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let input = input.trim();
        let bad = |reason: &str| ConfigError::InvalidAddress {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        if input.is_empty() {
            return Err(bad("empty address"));
        }

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| bad("unterminated '[' in IPv6 address"))?;
            match tail {
                "" => (host, None),
                t => (
                    host,
                    Some(t.strip_prefix(':').ok_or_else(|| bad("expected ':' after ']'"))?),
                ),
            }
        } else {
            match input.matches(':').count() {
                0 => (input, None),
                1 => {
                    let (h, p) = input.split_once(':').ok_or_else(|| bad("malformed"))?;
                    (h, Some(p))
                }
                _ => return Err(bad("IPv6 addresses must be written as [addr]:port")),
            }
        };

        if host.is_empty() {
            return Err(bad("empty host"));
        }
        if host.chars().any(|c| c.is_whitespace() || c == ',') {
            return Err(bad("host contains a separator"));
        }

        let port = match port {
            None => DEFAULT_PORT,
            Some(p) => match p.parse::<u16>() {
                Ok(0) => return Err(bad("port must be non-zero")),
                Ok(port) => port,
                Err(_) => return Err(bad("port is not a number in 1..=65535")),
            },
        };

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A server entry as supplied by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub address: ServerAddress,
    pub weight: u32,
    /// Endpoint used instead of `address` while it is unavailable in
    /// failure mode.
    pub standby: Option<ServerAddress>,
}

impl ServerSpec {
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address,
            weight: DEFAULT_SERVER_WEIGHT,
            standby: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_standby(mut self, standby: ServerAddress) -> Self {
        self.standby = Some(standby);
        self
    }

    /// Weights must lie in `1..=MAX_SERVER_WEIGHT`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.weight == 0 || self.weight > MAX_SERVER_WEIGHT {
            return Err(ConfigError::InvalidValue {
                field: "weight".to_string(),
                value: self.weight.to_string(),
                reason: format!("must be between 1 and {}", MAX_SERVER_WEIGHT),
            });
        }
        Ok(())
    }
}

/// Parse a whitespace separated server list.
///
/// Each entry is `host:port` optionally followed by `,standby_host:port`:
///
/// ```
/// use kaisen_core::parse_server_list;
///
/// let specs = parse_server_list("10.0.0.1:11211,10.0.0.9:11211 10.0.0.2:11211").unwrap();
/// assert_eq!(specs.len(), 2);
/// assert_eq!(specs[0].standby.as_ref().map(|s| s.host.as_str()), Some("10.0.0.9"));
/// ```
pub fn parse_server_list(input: &str) -> Result<Vec<ServerSpec>, ConfigError> {
    let mut specs = Vec::new();
    for entry in input.split_whitespace() {
        let mut parts = entry.split(',');
        let main = parts.next().unwrap_or_default();
        let mut spec = ServerSpec::new(ServerAddress::parse(main)?);
        if let Some(standby) = parts.next() {
            spec = spec.with_standby(ServerAddress::parse(standby)?);
        }
        if parts.next().is_some() {
            return Err(ConfigError::InvalidAddress {
                input: entry.to_string(),
                reason: "at most one standby per server".to_string(),
            });
        }
        specs.push(spec);
    }
    if specs.is_empty() {
        return Err(ConfigError::InvalidAddress {
            input: input.to_string(),
            reason: "server list is empty".to_string(),
        });
    }
    Ok(specs)
}

// ============================================================================
// PAYLOADS AND OPERATION OPTIONS
// ============================================================================

/// An encoded value as stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CachedData {
    /// Codec-defined flags stored next to the payload.
    pub flags: u32,
    pub data: Vec<u8>,
}

impl CachedData {
    pub fn new(flags: u32, data: Vec<u8>) -> Self {
        Self { flags, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Per-call options. Unset fields fall back to the facade defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpOptions {
    /// Bounded wait for this call.
    pub timeout: Option<Duration>,
    /// Expiration in seconds; 0 means never. For `flush_all` this is the delay.
    pub expiration: Option<u32>,
    /// Dispatch without waiting for the server reply.
    pub no_reply: bool,
}

impl OpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_expiration(mut self, seconds: u32) -> Self {
        self.expiration = Some(seconds);
        self
    }

    pub fn no_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }
}

// ============================================================================
// CAS
// ============================================================================

/// A value read together with its server compare token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasValue<T> {
    pub value: T,
    pub cas: CasToken,
}

impl<T> CasValue<T> {
    pub fn new(value: T, cas: CasToken) -> Self {
        Self { value, cas }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CasValue<U> {
        CasValue {
            value: f(self.value),
            cas: self.cas,
        }
    }
}

/// Result of a compare-and-set write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CasOutcome {
    /// Token matched and the value was written
    Stored,
    /// Entry changed since it was read
    Conflict,
    /// Entry no longer exists
    NotFound,
}

impl CasOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored)
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Facade-local statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Keys found on read
    pub hits: u64,
    /// Keys absent on read
    pub misses: u64,
    /// Calls collapsed to a sentinel because of a soft failure
    pub soft_failures: u64,
    /// Calls rejected before any I/O
    pub contract_violations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (hits / (hits + misses)).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_variants() {
        assert_eq!(
            ServerAddress::parse("cache-1:11311").unwrap(),
            ServerAddress::new("cache-1", 11311)
        );
        assert_eq!(
            ServerAddress::parse("cache-1").unwrap(),
            ServerAddress::new("cache-1", DEFAULT_PORT)
        );
        assert_eq!(
            ServerAddress::parse("[::1]:11211").unwrap(),
            ServerAddress::new("::1", 11211)
        );
        assert_eq!(
            ServerAddress::parse("[fe80::1]").unwrap(),
            ServerAddress::new("fe80::1", DEFAULT_PORT)
        );
    }

    #[test]
    fn test_parse_address_rejects_garbage() {
        for input in ["", ":11211", "host:", "host:0", "host:70000", "::1:11211", "[::1", "[::1]x"] {
            assert!(ServerAddress::parse(input).is_err(), "accepted {:?}", input);
        }
    }

    #[test]
    fn test_address_display() {
        assert_eq!(ServerAddress::new("a", 1).to_string(), "a:1");
        assert_eq!(ServerAddress::new("::1", 2).to_string(), "[::1]:2");
    }

    #[test]
    fn test_parse_server_list_with_standby() {
        let specs = parse_server_list("  a:1,b:2   c:3 ").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].address, ServerAddress::new("a", 1));
        assert_eq!(specs[0].standby, Some(ServerAddress::new("b", 2)));
        assert_eq!(specs[0].weight, DEFAULT_SERVER_WEIGHT);
        assert_eq!(specs[1].standby, None);
    }

    #[test]
    fn test_parse_server_list_rejects_empty_and_double_standby() {
        assert!(parse_server_list("   ").is_err());
        assert!(parse_server_list("a:1,b:2,c:3").is_err());
    }

    #[test]
    fn test_server_weight_bounds() {
        let spec = ServerSpec::new(ServerAddress::new("a", 1));
        assert!(spec.clone().validate().is_ok());
        assert!(spec.clone().with_weight(MAX_SERVER_WEIGHT).validate().is_ok());
        assert!(matches!(
            spec.clone().with_weight(0).validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            spec.with_weight(u32::MAX).validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_op_options_builder() {
        let opts = OpOptions::new()
            .with_timeout(Duration::from_millis(20))
            .with_expiration(60)
            .no_reply();
        assert_eq!(opts.timeout, Some(Duration::from_millis(20)));
        assert_eq!(opts.expiration, Some(60));
        assert!(opts.no_reply);
        assert_eq!(OpOptions::default().timeout, None);
    }

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 75,
            misses: 25,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_namespace_versions_are_distinct() {
        let a = new_namespace_version();
        let b = new_namespace_version();
        assert_ne!(a, b);
        assert_eq!(a.get_version_num(), 7);
    }

    #[test]
    fn test_cas_value_map_keeps_token() {
        let v = CasValue::new(2, 99).map(|n| n * 10);
        assert_eq!(v, CasValue::new(20, 99));
    }
}
