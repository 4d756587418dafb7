//! Resolved connection options.
//!
//! Connection-string tokenizing happens elsewhere; this module receives the
//! already-split `key → value` pairs and exposes the ones pooling cares about.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::PoolError;

/// Option names understood by the pool.
pub mod keys {
    /// Whether connections are pooled.
    pub const POOLING: &str = "pooling";
    /// Minimum pool size.
    pub const MIN_POOL_SIZE: &str = "min pool size";
    /// Maximum pool size.
    pub const MAX_POOL_SIZE: &str = "max pool size";
    /// Seconds a connection may live before it stops being pooled.
    pub const LOAD_BALANCE_TIMEOUT: &str = "load balance timeout";
    /// Synonym for [`LOAD_BALANCE_TIMEOUT`].
    pub const CONNECTION_LIFETIME: &str = "connection lifetime";
    /// Seconds to wait for a pooled connection.
    pub const CONNECT_TIMEOUT: &str = "connect timeout";
}

const SECRET_KEYS: &[&str] = &["password", "pwd"];

/// A flat, case-insensitive set of connection options.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    entries: BTreeMap<String, String>,
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionOptions({})", self.pool_key())
    }
}

fn normalize(key: &str) -> String {
    key.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

impl ConnectionOptions {
    /// Create an empty option set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an option, replacing any previous value for the same key.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add an option in place.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(normalize(key), value.into().trim().to_string());
    }

    /// Look up an option by case-insensitive key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&normalize(key)).map(String::as_str)
    }

    /// Number of options.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no options are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The identity under which pooled connections are shared.
    #[must_use]
    pub fn pool_key(&self) -> PoolKey {
        let canonical = self
            .entries
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";");
        PoolKey(canonical)
    }

    /// Whether pooling is enabled (default `true`).
    pub fn pooling(&self) -> Result<bool, PoolError> {
        match self.get(keys::POOLING) {
            None => Ok(true),
            Some(value) => parse_bool(keys::POOLING, value),
        }
    }

    /// Minimum pool size (default 0).
    pub fn min_pool_size(&self) -> Result<u32, PoolError> {
        self.parse_u32(keys::MIN_POOL_SIZE, 0)
    }

    /// Maximum pool size (default 100).
    pub fn max_pool_size(&self) -> Result<u32, PoolError> {
        self.parse_u32(keys::MAX_POOL_SIZE, 100)
    }

    /// Load-balance lifetime; `None` when zero or unset.
    pub fn load_balance_timeout(&self) -> Result<Option<Duration>, PoolError> {
        let seconds = match self.get(keys::LOAD_BALANCE_TIMEOUT) {
            Some(_) => self.parse_u32(keys::LOAD_BALANCE_TIMEOUT, 0)?,
            None => self.parse_u32(keys::CONNECTION_LIFETIME, 0)?,
        };
        Ok((seconds > 0).then(|| Duration::from_secs(u64::from(seconds))))
    }

    /// Time to wait for a connection, if set.
    pub fn connect_timeout(&self) -> Result<Option<Duration>, PoolError> {
        match self.get(keys::CONNECT_TIMEOUT) {
            None => Ok(None),
            Some(_) => self
                .parse_u32(keys::CONNECT_TIMEOUT, 0)
                .map(|s| Some(Duration::from_secs(u64::from(s)))),
        }
    }

    fn parse_u32(&self, key: &str, default: u32) -> Result<u32, PoolError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| {
                PoolError::Configuration(format!("invalid value {value:?} for option {key:?}"))
            }),
        }
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for ConnectionOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut options = Self::new();
        for (key, value) in iter {
            options.insert(key.as_ref(), value);
        }
        options
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, PoolError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" => Ok(true),
        "false" | "no" => Ok(false),
        _ => Err(PoolError::Configuration(format!(
            "invalid boolean {value:?} for option {key:?}"
        ))),
    }
}

/// Canonical identity of a fully-resolved option set.
///
/// Two option sets share pooled connections only if their keys are equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey(String);

impl PoolKey {
    /// The canonical `key=value;...` form, secrets included.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for pair in self.0.split(';').filter(|p| !p.is_empty()) {
            if !first {
                f.write_str(";")?;
            }
            first = false;
            match pair.split_once('=') {
                Some((key, _)) if SECRET_KEYS.contains(&key) => write!(f, "{key}=***")?,
                _ => f.write_str(pair)?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolKey({self})")
    }
}
