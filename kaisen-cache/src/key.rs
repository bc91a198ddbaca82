//! Wire key derivation.
//!
//! Every logical key is turned into a wire key before it leaves the process:
//!
//! ```text
//! <prefix>:<key>                          no namespace active
//! <prefix>:@<namespace>#<version>:<key>   inside a namespace
//! ```
//!
//! Logical keys may not start with `@`, so a namespaced wire key can never
//! collide with an unscoped one. Namespace tokens themselves live under
//! `namespace-token:<namespace>`, which is shared by every prefix so that one
//! invalidation reaches all facades on the same servers.

use kaisen_core::{
    ConfigError, ContractViolation, NamespaceVersion, KEY_SEPARATOR, MAX_KEY_LENGTH,
    NAMESPACE_TOKEN_KEY_PREFIX, NAMESPACE_TOKEN_MARKER, NAMESPACE_VERSION_SEPARATOR,
};
use std::fmt;

/// A fully derived key as sent to the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WireKey(String);

impl WireKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for WireKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WireKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The current version of one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespaceToken {
    name: String,
    version: NamespaceVersion,
}

impl NamespaceToken {
    pub fn new(name: impl Into<String>, version: NamespaceVersion) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> NamespaceVersion {
        self.version
    }

    /// The segment embedded in wire keys: `@<name>#<version>`.
    pub fn render(&self) -> String {
        format!(
            "{}{}{}{}",
            NAMESPACE_TOKEN_MARKER,
            urlencoding::encode(&self.name),
            NAMESPACE_VERSION_SEPARATOR,
            self.version.as_hyphenated()
        )
    }
}

/// Derives wire keys for one facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespacer {
    prefix: String,
    sanitize: bool,
}

impl KeyNamespacer {
    /// Create a namespacer for `prefix`.
    ///
    /// The prefix must be non-empty, free of whitespace and control
    /// characters, and must not produce keys under `namespace-token:`.
    pub fn new(prefix: impl Into<String>, sanitize: bool) -> Result<Self, ConfigError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "prefix".to_string(),
                value: prefix,
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(reason) = illegal_char_reason(&prefix) {
            return Err(ConfigError::InvalidValue {
                field: "prefix".to_string(),
                value: prefix,
                reason: reason.to_string(),
            });
        }
        if format!("{}{}", prefix, KEY_SEPARATOR).starts_with(NAMESPACE_TOKEN_KEY_PREFIX) {
            return Err(ConfigError::InvalidValue {
                field: "prefix".to_string(),
                value: prefix,
                reason: "would share the namespace token keyspace".to_string(),
            });
        }
        Ok(Self { prefix, sanitize })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn sanitizes(&self) -> bool {
        self.sanitize
    }

    /// Derive the wire key for `key`, optionally inside a namespace.
    pub fn resolve(
        &self,
        key: &str,
        token: Option<&NamespaceToken>,
    ) -> Result<WireKey, ContractViolation> {
        if key.is_empty() {
            return Err(ContractViolation::EmptyKey);
        }
        if key.starts_with(NAMESPACE_TOKEN_MARKER) || key.starts_with(NAMESPACE_TOKEN_KEY_PREFIX)
        {
            return Err(ContractViolation::InvalidKey {
                key: key.to_string(),
                reason: "prefix is reserved for namespace tokens".to_string(),
            });
        }

        let encoded;
        let key_part = if self.sanitize {
            encoded = urlencoding::encode(key);
            encoded.as_ref()
        } else {
            if let Some(reason) = illegal_char_reason(key) {
                return Err(ContractViolation::InvalidKey {
                    key: key.to_string(),
                    reason: reason.to_string(),
                });
            }
            key
        };

        let mut wire = String::with_capacity(self.prefix.len() + key_part.len() + 64);
        wire.push_str(&self.prefix);
        wire.push(KEY_SEPARATOR);
        if let Some(token) = token {
            wire.push_str(&token.render());
            wire.push(KEY_SEPARATOR);
        }
        wire.push_str(key_part);

        check_length(key, &wire)?;
        Ok(WireKey(wire))
    }
}

/// Control key under which a namespace's token is stored.
pub fn control_key(name: &str) -> Result<WireKey, ContractViolation> {
    if name.is_empty() {
        return Err(ContractViolation::EmptyNamespace);
    }
    let wire = format!("{}{}", NAMESPACE_TOKEN_KEY_PREFIX, urlencoding::encode(name));
    check_length(name, &wire)?;
    Ok(WireKey(wire))
}

fn check_length(key: &str, wire: &str) -> Result<(), ContractViolation> {
    if wire.len() > MAX_KEY_LENGTH {
        return Err(ContractViolation::InvalidKey {
            key: key.to_string(),
            reason: format!(
                "wire key is {} bytes, limit is {}",
                wire.len(),
                MAX_KEY_LENGTH
            ),
        });
    }
    Ok(())
}

fn illegal_char_reason(s: &str) -> Option<&'static str> {
    if s.chars().any(char::is_whitespace) {
        Some("contains whitespace")
    } else if s.chars().any(char::is_control) {
        Some("contains control characters")
    } else {
        None
    }
}
