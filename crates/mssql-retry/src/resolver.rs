//! Resolution of configured retry policies.
//!
//! Policies are looked up in an explicit registry of factories keyed by
//! family and method name. The built-in family is always present and
//! provides `fixed`, `incremental`, `exponential` and `none`.
//!
//! Resolution never fails outward: [`PolicyResolver::resolve`] falls back to
//! [`RetryPolicy::none`] and reports why through `tracing` and the optional
//! diagnostic sink. Use [`PolicyResolver::try_resolve`] to see the error.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use thiserror::Error;

use crate::config::{ConfigError, RetryConfig, RetryOptions};
use crate::policy::RetryPolicy;

/// Name of the built-in provider family.
pub const BUILTIN_FAMILY: &str = "builtin";

/// Factory producing a value that should be a [`RetryPolicy`].
///
/// Registered untyped factories are checked after invocation; anything that
/// does not downcast to a `RetryPolicy` is rejected.
pub type PolicyFactory = Arc<dyn Fn(&RetryOptions) -> Box<dyn Any + Send> + Send + Sync>;

/// Receives every resolution failure that caused a fallback.
pub type DiagnosticSink = Arc<dyn Fn(&ResolveError) + Send + Sync>;

/// Why a configuration could not be turned into a policy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResolveError {
    /// No configuration was supplied.
    #[error("no retry configuration supplied")]
    MissingConfig,

    /// The configuration failed validation.
    #[error("invalid retry configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The method is not registered in the selected family.
    #[error("retry method {method:?} is not registered in family {family:?}")]
    UnknownMethod {
        /// Family that was searched.
        family: String,
        /// Requested method.
        method: String,
    },

    /// The factory returned something other than a retry policy.
    #[error("retry method {method:?} in family {family:?} did not return a retry policy")]
    InvalidReturnType {
        /// Family of the factory.
        family: String,
        /// Method of the factory.
        method: String,
    },

    /// The factory panicked.
    #[error("retry method {method:?} in family {family:?} panicked")]
    FactoryPanicked {
        /// Family of the factory.
        family: String,
        /// Method of the factory.
        method: String,
    },
}

/// Registry of retry policy factories.
#[derive(Clone)]
pub struct PolicyResolver {
    families: HashMap<String, HashMap<String, PolicyFactory>>,
    diagnostics: Option<DiagnosticSink>,
}

impl fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut families: Vec<_> = self.families.keys().collect();
        families.sort();
        f.debug_struct("PolicyResolver")
            .field("families", &families)
            .field("has_diagnostics", &self.diagnostics.is_some())
            .finish()
    }
}

impl Default for PolicyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyResolver {
    /// Create a resolver with the built-in family registered.
    #[must_use]
    pub fn new() -> Self {
        let mut resolver = Self {
            families: HashMap::new(),
            diagnostics: None,
        };
        resolver
            .register(BUILTIN_FAMILY, "fixed", RetryPolicy::fixed)
            .register(BUILTIN_FAMILY, "incremental", RetryPolicy::incremental)
            .register(BUILTIN_FAMILY, "exponential", RetryPolicy::exponential)
            .register(BUILTIN_FAMILY, "none", |_| RetryPolicy::none());
        resolver
    }

    /// Report fallbacks to `sink` in addition to `tracing`.
    #[must_use]
    pub fn with_diagnostics<F>(mut self, sink: F) -> Self
    where
        F: Fn(&ResolveError) + Send + Sync + 'static,
    {
        self.diagnostics = Some(Arc::new(sink));
        self
    }

    /// Register a typed factory. Names are case-sensitive.
    pub fn register<F>(&mut self, family: &str, method: &str, factory: F) -> &mut Self
    where
        F: Fn(&RetryOptions) -> RetryPolicy + Send + Sync + 'static,
    {
        self.register_untyped(family, method, move |options| {
            Box::new(factory(options)) as Box<dyn Any + Send>
        })
    }

    /// Register a factory whose return type is only checked at resolution time.
    pub fn register_untyped<F>(&mut self, family: &str, method: &str, factory: F) -> &mut Self
    where
        F: Fn(&RetryOptions) -> Box<dyn Any + Send> + Send + Sync + 'static,
    {
        self.families
            .entry(family.to_string())
            .or_default()
            .insert(method.to_string(), Arc::new(factory));
        self
    }

    /// Check if a family is registered.
    #[must_use]
    pub fn has_family(&self, family: &str) -> bool {
        self.families.contains_key(family)
    }

    /// Resolve a policy, falling back to [`RetryPolicy::none`] on any failure.
    #[must_use]
    pub fn resolve(&self, config: Option<&RetryConfig>) -> RetryPolicy {
        let result = match config {
            Some(config) => self.try_resolve(config),
            None => Err(ResolveError::MissingConfig),
        };

        match result {
            Ok(policy) => policy,
            Err(error) => {
                if matches!(error, ResolveError::MissingConfig) {
                    tracing::debug!("no retry configuration; retries disabled");
                } else {
                    tracing::warn!(
                        error = %error,
                        "retry configuration could not be resolved; retries disabled"
                    );
                }
                if let Some(sink) = &self.diagnostics {
                    sink(&error);
                }
                RetryPolicy::none()
            }
        }
    }

    /// Resolve a connection-open policy.
    ///
    /// Statement conditions have no meaning while opening and are dropped.
    #[must_use]
    pub fn resolve_connection(&self, config: Option<&RetryConfig>) -> RetryPolicy {
        let config = config.map(|c| RetryConfig {
            authorized_sql_condition: None,
            ..c.clone()
        });
        self.resolve(config.as_ref())
    }

    /// Resolve a command execution policy.
    #[must_use]
    pub fn resolve_command(&self, config: Option<&RetryConfig>) -> RetryPolicy {
        self.resolve(config)
    }

    /// Resolve a policy, reporting failures to the caller.
    pub fn try_resolve(&self, config: &RetryConfig) -> Result<RetryPolicy, ResolveError> {
        let options = config.to_options()?;
        let family = self.select_family(config.retry_logic_type.as_deref());
        let method = config.retry_method.trim();

        let factory = self
            .families
            .get(family)
            .and_then(|methods| methods.get(method))
            .ok_or_else(|| ResolveError::UnknownMethod {
                family: family.to_string(),
                method: method.to_string(),
            })?;

        let produced = catch_unwind(AssertUnwindSafe(|| factory(&options))).map_err(|_| {
            ResolveError::FactoryPanicked {
                family: family.to_string(),
                method: method.to_string(),
            }
        })?;

        let policy = produced
            .downcast::<RetryPolicy>()
            .map_err(|_| ResolveError::InvalidReturnType {
                family: family.to_string(),
                method: method.to_string(),
            })?;

        tracing::debug!(family, method, max_attempts = policy.max_attempts(), "resolved retry policy");
        Ok(*policy)
    }

    fn select_family<'a>(&self, requested: Option<&'a str>) -> &'a str {
        match requested.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) if self.families.contains_key(name) => name,
            Some(name) => {
                tracing::debug!(
                    family = name,
                    "retry provider family not registered; using built-in providers"
                );
                BUILTIN_FAMILY
            }
            None => BUILTIN_FAMILY,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn collecting_resolver() -> (PolicyResolver, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let resolver =
            PolicyResolver::new().with_diagnostics(move |e| sink.lock().push(e.to_string()));
        (resolver, seen)
    }

    #[test]
    fn test_builtin_methods() {
        let resolver = PolicyResolver::new();
        for method in ["fixed", "incremental", "exponential"] {
            let config = RetryConfig::new(method)
                .number_of_tries(4)
                .delta_time(Duration::from_millis(10));
            let policy = resolver.try_resolve(&config).unwrap();
            assert_eq!(policy.max_attempts(), 4);
        }
        let none = resolver.try_resolve(&RetryConfig::new("none").number_of_tries(9)).unwrap();
        assert_eq!(none.max_attempts(), 1);
    }

    #[test]
    fn test_custom_family_is_case_sensitive() {
        let mut resolver = PolicyResolver::new();
        resolver.register("Custom", "fixed", |_| {
            RetryPolicy::new(7, crate::IntervalPolicy::none())
        });

        let custom = RetryConfig::new("fixed").retry_logic_type("Custom").number_of_tries(2);
        assert_eq!(resolver.resolve(Some(&custom)).max_attempts(), 7);

        // Falls back to the built-in family, which also has "fixed".
        let lower = RetryConfig::new("fixed").retry_logic_type("custom").number_of_tries(2);
        assert_eq!(resolver.resolve(Some(&lower)).max_attempts(), 2);
    }

    #[test]
    fn test_empty_method_falls_back_to_none() {
        let (resolver, seen) = collecting_resolver();
        let policy = resolver.resolve(Some(&RetryConfig::new("").number_of_tries(5)));
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_unknown_type_and_method_falls_back_to_none() {
        let (resolver, seen) = collecting_resolver();
        let config = RetryConfig::new("Aggressive")
            .retry_logic_type("Missing.Provider")
            .number_of_tries(5);
        let policy = resolver.resolve(Some(&config));
        assert_eq!(policy.max_attempts(), 1);
        assert!(seen.lock()[0].contains("Aggressive"));
    }

    #[test]
    fn test_wrong_return_type_falls_back_to_none() {
        let (mut resolver, seen) = collecting_resolver();
        resolver.register_untyped("Custom", "broken", |_| {
            Box::new(42u32) as Box<dyn Any + Send>
        });

        let config = RetryConfig::new("broken").retry_logic_type("Custom").number_of_tries(5);
        assert!(matches!(
            resolver.try_resolve(&config),
            Err(ResolveError::InvalidReturnType { .. })
        ));
        assert_eq!(resolver.resolve(Some(&config)).max_attempts(), 1);
        assert!(seen.lock()[0].contains("did not return a retry policy"));
    }

    #[test]
    fn test_panicking_factory_falls_back_to_none() {
        let mut resolver = PolicyResolver::new();
        resolver.register("Custom", "explodes", |_| panic!("factory failure"));

        let config = RetryConfig::new("explodes").retry_logic_type("Custom");
        assert!(matches!(
            resolver.try_resolve(&config),
            Err(ResolveError::FactoryPanicked { .. })
        ));
        assert_eq!(resolver.resolve(Some(&config)).max_attempts(), 1);
    }

    #[test]
    fn test_invalid_numbers_fall_back_to_none() {
        let (resolver, seen) = collecting_resolver();
        let config = RetryConfig::new("fixed").number_of_tries(100);
        assert_eq!(resolver.resolve(Some(&config)).max_attempts(), 1);
        assert!(seen.lock()[0].contains("number of tries"));
    }

    #[test]
    fn test_missing_config_is_reported() {
        let (resolver, seen) = collecting_resolver();
        assert_eq!(resolver.resolve(None).max_attempts(), 1);
        assert_eq!(seen.lock().as_slice(), ["no retry configuration supplied"]);
    }

    #[test]
    fn test_connection_section_ignores_sql_condition() {
        let resolver = PolicyResolver::new();
        let config = RetryConfig::new("fixed")
            .number_of_tries(3)
            .authorized_sql_condition("^SELECT");

        let connection = resolver.resolve_connection(Some(&config));
        assert!(connection.is_eligible(Some("UPDATE t")));

        let command = resolver.resolve_command(Some(&config));
        assert!(!command.is_eligible(Some("UPDATE t")));
        assert!(command.is_eligible(Some("SELECT 1")));
    }

    #[test]
    fn test_allow_list_overrides_builtin_table() {
        let resolver = PolicyResolver::new();
        let config = RetryConfig::new("fixed").number_of_tries(3).transient_errors("208");
        let policy = resolver.try_resolve(&config).unwrap();

        assert!(policy.is_transient(&crate::Fault::server(208, "invalid object")));
        assert!(!policy.is_transient(&crate::Fault::server(1205, "deadlock")));
    }
}
