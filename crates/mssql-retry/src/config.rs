//! Declarative retry configuration.
//!
//! A [`RetryConfig`] is what an application writes in its configuration
//! file; it names a policy family and factory method plus numeric
//! parameters. [`RetryConfig::to_options`] validates it into the
//! [`RetryOptions`] that policy factories receive.

use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::interval::{IntervalPolicy, MAX_INTERVAL};
use crate::transient::TransientErrors;

/// Largest accepted number of tries, including the first attempt.
pub const MAX_NUMBER_OF_TRIES: u32 = 60;

/// Errors found while validating retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// No factory method was named.
    #[error("retry method name must not be empty")]
    EmptyMethod,

    /// Number of tries outside `1..=60`.
    #[error("number of tries {0} is outside the allowed range 1..=60")]
    TriesOutOfRange(u32),

    /// An interval parameter exceeds the allowed maximum.
    #[error("{name} interval {value:?} exceeds the maximum of {max:?}")]
    IntervalOutOfRange {
        /// Which parameter.
        name: &'static str,
        /// The configured value.
        value: Duration,
        /// The allowed maximum.
        max: Duration,
    },

    /// Minimum interval above the maximum interval.
    #[error("minimum interval {min:?} is greater than maximum interval {max:?}")]
    MinAboveMax {
        /// Configured minimum.
        min: Duration,
        /// Configured maximum.
        max: Duration,
    },

    /// Transient error allow-list is not a comma-separated list of integers.
    #[error("invalid transient error list: {0:?}")]
    InvalidTransientErrors(String),

    /// Authorized SQL condition is not a valid regular expression.
    #[error("invalid authorized SQL condition: {0}")]
    InvalidSqlCondition(String),

    /// The configuration document could not be parsed.
    #[error("invalid retry configuration document: {0}")]
    Parse(String),
}

fn default_number_of_tries() -> u32 {
    1
}

fn default_max_time() -> Duration {
    MAX_INTERVAL
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// One retry configuration section.
///
/// Durations are written as integer milliseconds:
///
/// ```rust
/// use mssql_retry::RetryConfig;
///
/// let config: RetryConfig = serde_json::from_str(
///     r#"{ "retryMethod": "exponential", "numberOfTries": 5, "deltaTime": 1000 }"#,
/// ).unwrap();
/// assert_eq!(config.number_of_tries, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct RetryConfig {
    /// Registered custom provider family; the built-in family when absent.
    #[serde(default)]
    pub retry_logic_type: Option<String>,

    /// Factory method within the family.
    pub retry_method: String,

    /// Total attempts including the first one.
    #[serde(default = "default_number_of_tries")]
    pub number_of_tries: u32,

    /// Base step of the interval strategy.
    #[serde(deserialize_with = "millis::deserialize")]
    pub delta_time: Duration,

    /// Lower bound for intervals.
    #[serde(default, deserialize_with = "millis::deserialize")]
    pub min_time: Duration,

    /// Upper bound for intervals.
    #[serde(default = "default_max_time", deserialize_with = "millis::deserialize")]
    pub max_time: Duration,

    /// Comma-separated error numbers replacing the built-in transient table.
    #[serde(default)]
    pub transient_errors: Option<String>,

    /// Regular expression a statement must match to be retried.
    ///
    /// Only meaningful for the command section.
    #[serde(default)]
    pub authorized_sql_condition: Option<String>,
}

impl RetryConfig {
    /// Create a configuration naming a built-in method.
    pub fn new(retry_method: impl Into<String>) -> Self {
        Self {
            retry_logic_type: None,
            retry_method: retry_method.into(),
            number_of_tries: default_number_of_tries(),
            delta_time: Duration::ZERO,
            min_time: Duration::ZERO,
            max_time: default_max_time(),
            transient_errors: None,
            authorized_sql_condition: None,
        }
    }

    /// Select a registered provider family.
    #[must_use]
    pub fn retry_logic_type(mut self, name: impl Into<String>) -> Self {
        self.retry_logic_type = Some(name.into());
        self
    }

    /// Set the number of tries.
    #[must_use]
    pub fn number_of_tries(mut self, tries: u32) -> Self {
        self.number_of_tries = tries;
        self
    }

    /// Set the interval step.
    #[must_use]
    pub fn delta_time(mut self, delta: Duration) -> Self {
        self.delta_time = delta;
        self
    }

    /// Set the minimum interval.
    #[must_use]
    pub fn min_time(mut self, min: Duration) -> Self {
        self.min_time = min;
        self
    }

    /// Set the maximum interval.
    #[must_use]
    pub fn max_time(mut self, max: Duration) -> Self {
        self.max_time = max;
        self
    }

    /// Replace the built-in transient error table.
    #[must_use]
    pub fn transient_errors(mut self, list: impl Into<String>) -> Self {
        self.transient_errors = Some(list.into());
        self
    }

    /// Only retry statements matching `pattern`.
    #[must_use]
    pub fn authorized_sql_condition(mut self, pattern: impl Into<String>) -> Self {
        self.authorized_sql_condition = Some(pattern.into());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.to_options().map(|_| ())
    }

    /// Validate and convert into the options handed to policy factories.
    pub fn to_options(&self) -> Result<RetryOptions, ConfigError> {
        if self.retry_method.trim().is_empty() {
            return Err(ConfigError::EmptyMethod);
        }
        if !(1..=MAX_NUMBER_OF_TRIES).contains(&self.number_of_tries) {
            return Err(ConfigError::TriesOutOfRange(self.number_of_tries));
        }
        IntervalPolicy::fixed(self.delta_time)
            .min_interval(self.min_time)
            .max_interval(self.max_time)
            .validate()?;

        let transient_errors = match &self.transient_errors {
            Some(list) => TransientErrors::parse(list)?,
            None => TransientErrors::default(),
        };

        let authorized_sql = self
            .authorized_sql_condition
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| ConfigError::InvalidSqlCondition(e.to_string()))?;

        Ok(RetryOptions {
            number_of_tries: self.number_of_tries,
            delta_time: self.delta_time,
            min_time: self.min_time,
            max_time: self.max_time,
            transient_errors,
            authorized_sql,
        })
    }
}

/// Validated parameters passed to a policy factory.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RetryOptions {
    /// Total attempts including the first one.
    pub number_of_tries: u32,
    /// Base step of the interval strategy.
    pub delta_time: Duration,
    /// Lower bound for intervals.
    pub min_time: Duration,
    /// Upper bound for intervals.
    pub max_time: Duration,
    /// Error numbers that trigger a retry.
    pub transient_errors: TransientErrors,
    /// Statements must match this to be retried.
    pub authorized_sql: Option<Regex>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            number_of_tries: 1,
            delta_time: Duration::ZERO,
            min_time: Duration::ZERO,
            max_time: MAX_INTERVAL,
            transient_errors: TransientErrors::default(),
            authorized_sql: None,
        }
    }
}

/// The connection and command retry sections of an application's configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySections {
    /// Policy applied while opening connections.
    #[serde(default)]
    pub connection: Option<RetryConfig>,
    /// Policy applied while executing commands.
    #[serde(default)]
    pub command: Option<RetryConfig>,
}

impl RetrySections {
    /// Parse the sections from a JSON document.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RetryConfig::new("fixed");
        assert_eq!(config.number_of_tries, 1);
        assert_eq!(config.max_time, MAX_INTERVAL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = RetryConfig::new("incremental")
            .retry_logic_type("custom")
            .number_of_tries(5)
            .delta_time(Duration::from_millis(500))
            .min_time(Duration::from_millis(100))
            .max_time(Duration::from_secs(10))
            .transient_errors("1205,4060");

        let options = config.to_options().unwrap();
        assert_eq!(options.number_of_tries, 5);
        assert_eq!(options.transient_errors.len(), 2);
        assert!(options.authorized_sql.is_none());
        assert_eq!(config.retry_logic_type.as_deref(), Some("custom"));
    }

    #[test]
    fn test_validation_empty_method() {
        let err = RetryConfig::new("  ").validate().unwrap_err();
        assert_eq!(err, ConfigError::EmptyMethod);
    }

    #[test]
    fn test_validation_tries_range() {
        assert!(RetryConfig::new("fixed").number_of_tries(0).validate().is_err());
        assert!(RetryConfig::new("fixed").number_of_tries(61).validate().is_err());
        assert!(RetryConfig::new("fixed").number_of_tries(60).validate().is_ok());
    }

    #[test]
    fn test_validation_interval_range() {
        let err = RetryConfig::new("fixed")
            .delta_time(Duration::from_secs(121))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("delta interval"));

        let err = RetryConfig::new("fixed")
            .min_time(Duration::from_secs(3))
            .max_time(Duration::from_secs(2))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MinAboveMax { .. }));
    }

    #[test]
    fn test_validation_sql_condition() {
        let options = RetryConfig::new("fixed")
            .authorized_sql_condition("^SELECT")
            .to_options()
            .unwrap();
        assert!(options.authorized_sql.unwrap().is_match("SELECT 1"));

        let err = RetryConfig::new("fixed")
            .authorized_sql_condition("(unclosed")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSqlCondition(_)));
    }

    #[test]
    fn test_sections_from_json() {
        let sections = RetrySections::from_json(
            r#"{
                "connection": { "retryMethod": "fixed", "numberOfTries": 3, "deltaTime": 250 },
                "command": {
                    "retryLogicType": "custom",
                    "retryMethod": "aggressive",
                    "deltaTime": 100,
                    "maxTime": 5000,
                    "transientErrors": "1205",
                    "authorizedSqlCondition": "^SELECT"
                }
            }"#,
        )
        .unwrap();

        let connection = sections.connection.unwrap();
        assert_eq!(connection.number_of_tries, 3);
        assert_eq!(connection.delta_time, Duration::from_millis(250));

        let command = sections.command.unwrap();
        assert_eq!(command.retry_logic_type.as_deref(), Some("custom"));
        assert_eq!(command.max_time, Duration::from_secs(5));
        assert_eq!(command.number_of_tries, 1);
    }

    #[test]
    fn test_sections_from_invalid_json() {
        let err = RetrySections::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(RetrySections::from_json("{}").unwrap().connection.is_none());
    }
}
