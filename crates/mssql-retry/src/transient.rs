//! Known-transient server error numbers.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::ConfigError;
use crate::fault::RetryableFault;

/// Server error numbers treated as transient when no allow-list is configured.
///
/// Covers lock and deadlock timeouts, resource-governance throttling and
/// the availability errors Azure SQL reports during reconfiguration.
pub const KNOWN_TRANSIENT_ERRORS: &[i32] = &[
    // Pre-login handshake / transport level errors.
    233, 997,
    // Lock request timeout and deadlock victim.
    1204, 1205, 1222,
    // Cannot open database / login failures during failover.
    4060, 4221,
    // Resource limits reached.
    10928, 10929,
    // Azure SQL service errors.
    40143, 40197, 40501, 40540, 40613,
    // Failover group and elastic pool reconfiguration.
    42108, 42109,
    // Hyperscale log rate throttling.
    49918, 49919, 49920,
];

/// Accepts a comma-separated list of non-negative integers, with optional blanks.
static ERROR_LIST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([ \t]*\d+(?:[ \t]*,[ \t]*\d+)*[ \t]*)*$").unwrap());

/// A set of server error numbers that should trigger a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientErrors {
    numbers: HashSet<i32>,
}

impl Default for TransientErrors {
    fn default() -> Self {
        Self::from_numbers(KNOWN_TRANSIENT_ERRORS.iter().copied())
    }
}

impl TransientErrors {
    /// Build a set from explicit error numbers.
    pub fn from_numbers(numbers: impl IntoIterator<Item = i32>) -> Self {
        Self {
            numbers: numbers.into_iter().collect(),
        }
    }

    /// Parse a comma-separated allow-list such as `"1205, 40613"`.
    ///
    /// An empty or blank list yields an empty set, which disables
    /// error-number based retries entirely.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        if !ERROR_LIST_RE.is_match(list) {
            return Err(ConfigError::InvalidTransientErrors(list.to_string()));
        }

        let mut numbers = HashSet::new();
        for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let number = part
                .parse::<i32>()
                .map_err(|_| ConfigError::InvalidTransientErrors(list.to_string()))?;
            numbers.insert(number);
        }
        Ok(Self { numbers })
    }

    /// Check if an error number is in the set.
    #[must_use]
    pub fn contains(&self, number: i32) -> bool {
        self.numbers.contains(&number)
    }

    /// Number of distinct error numbers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.numbers.len()
    }

    /// Check if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }

    /// Classify a fault.
    ///
    /// A fault is transient when any of its server errors is in the set and
    /// the server did not forbid reconnecting.
    #[must_use]
    pub fn is_transient(&self, fault: &dyn RetryableFault) -> bool {
        if fault.reconnect_forbidden() {
            return false;
        }
        fault
            .server_errors()
            .iter()
            .any(|error| self.contains(error.number))
    }
}
