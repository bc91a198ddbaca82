//! Error types for kaisen cache operations

use std::time::Duration;
use thiserror::Error;

/// Errors reported by a remote store connection.
///
/// These are the outbound failures: anything the remote key-value store (or
/// the transport in front of it) could not service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Server {server} rejected request: {reason}")]
    Rejected { server: String, reason: String },

    #[error("I/O failure talking to {server}: {reason}")]
    Io { server: String, reason: String },

    #[error("Connection to {server} is closed")]
    Closed { server: String },

    #[error("Value for key {key} is not a decimal counter")]
    NonNumeric { key: String },
}

impl StoreError {
    /// Whether this failure says something about the endpoint's health.
    ///
    /// I/O and closed-connection failures count towards eviction; a server
    /// that answers with a rejection is alive.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Closed { .. })
    }
}

/// Caller-contract violations, detected before any network activity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("Key must not be empty")]
    EmptyKey,

    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Null value passed to {operation}")]
    NullValue { operation: &'static str },

    #[error("Namespace name must not be empty")]
    EmptyNamespace,

    #[error("end_namespace called without a matching begin_namespace")]
    UnbalancedNamespace,
}

/// Value codec errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to encode value: {reason}")]
    Encode { reason: String },

    #[error("Failed to decode value: {reason}")]
    Decode { reason: String },

    #[error("Encoded payload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Invalid server address {input:?}: {reason}")]
    InvalidAddress { input: String, reason: String },

    #[error("Failed to read config file: {reason}")]
    Io { reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },
}

/// Master error type for all cache operations.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("{operation} was interrupted while waiting for a reply")]
    Interrupted { operation: &'static str },

    #[error("Protocol error: {0}")]
    Protocol(#[from] StoreError),

    #[error("No reachable server: {reason}")]
    Connectivity { reason: String },

    #[error("Contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Soft failures are collapsed to a sentinel at the facade boundary.
    ///
    /// Contract violations and configuration errors are not soft failures:
    /// they are caller bugs, even though the sentinel API also returns the
    /// sentinel for them.
    pub fn is_soft_failure(&self) -> bool {
        !matches!(self, Self::Contract(_) | Self::Config(_))
    }

    /// Whether this error should count against the endpoint it happened on.
    pub fn counts_against_endpoint(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Protocol(e) => e.is_connectivity(),
            _ => false,
        }
    }
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display_rejected() {
        let err = StoreError::Rejected {
            server: "10.0.0.1:11211".to_string(),
            reason: "SERVER_ERROR out of memory".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("10.0.0.1:11211"));
        assert!(msg.contains("out of memory"));
    }

    #[test]
    fn test_store_error_connectivity_classification() {
        assert!(StoreError::Io {
            server: "a:1".to_string(),
            reason: "reset".to_string()
        }
        .is_connectivity());
        assert!(StoreError::Closed {
            server: "a:1".to_string()
        }
        .is_connectivity());
        assert!(!StoreError::Rejected {
            server: "a:1".to_string(),
            reason: "bad".to_string()
        }
        .is_connectivity());
        assert!(!StoreError::NonNumeric {
            key: "k".to_string()
        }
        .is_connectivity());
    }

    #[test]
    fn test_contract_violation_display() {
        let err = ContractViolation::NullValue { operation: "set" };
        assert!(format!("{}", err).contains("set"));

        let err = ContractViolation::InvalidKey {
            key: "a b".to_string(),
            reason: "contains whitespace".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("a b"));
        assert!(msg.contains("whitespace"));
    }

    #[test]
    fn test_codec_error_too_large_display() {
        let err = CodecError::TooLarge {
            size: 2_000_000,
            limit: 1_048_576,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("2000000"));
        assert!(msg.contains("1048576"));
    }

    #[test]
    fn test_cache_error_from_variants() {
        let protocol = CacheError::from(StoreError::Closed {
            server: "a:1".to_string(),
        });
        assert!(matches!(protocol, CacheError::Protocol(_)));

        let contract = CacheError::from(ContractViolation::EmptyKey);
        assert!(matches!(contract, CacheError::Contract(_)));

        let codec = CacheError::from(CodecError::Decode {
            reason: "eof".to_string(),
        });
        assert!(matches!(codec, CacheError::Codec(_)));

        let config = CacheError::from(ConfigError::Parse {
            reason: "bad toml".to_string(),
        });
        assert!(matches!(config, CacheError::Config(_)));
    }

    #[test]
    fn test_soft_failure_classification() {
        let timeout = CacheError::Timeout {
            operation: "get",
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_soft_failure());
        assert!(timeout.counts_against_endpoint());

        let interrupted = CacheError::Interrupted { operation: "get" };
        assert!(interrupted.is_soft_failure());
        assert!(!interrupted.counts_against_endpoint());

        let rejected = CacheError::from(StoreError::Rejected {
            server: "a:1".to_string(),
            reason: "nope".to_string(),
        });
        assert!(rejected.is_soft_failure());
        assert!(!rejected.counts_against_endpoint());

        let contract = CacheError::from(ContractViolation::EmptyKey);
        assert!(!contract.is_soft_failure());
        assert!(!contract.counts_against_endpoint());
    }
}
