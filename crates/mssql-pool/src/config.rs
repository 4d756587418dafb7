//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;
use crate::options::ConnectionOptions;

/// Default time to wait for a pooled connection.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for a connection pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Whether connections are pooled at all.
    pub pooling: bool,

    /// Minimum number of connections to maintain.
    pub min_connections: u32,

    /// Maximum number of connections allowed.
    pub max_connections: u32,

    /// Time to wait for a connection before timing out.
    pub connection_timeout: Duration,

    /// Connections older than this are not returned to the pool.
    pub load_balance_timeout: Option<Duration>,

    /// Whether to probe connections for liveness on checkout.
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pooling: true,
            min_connections: 0,
            max_connections: 100,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            load_balance_timeout: None,
            test_on_checkout: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the configuration from resolved connection options.
    pub fn from_options(options: &ConnectionOptions) -> Result<Self, PoolError> {
        let mut config = Self::new()
            .pooling(options.pooling()?)
            .min_connections(options.min_pool_size()?)
            .max_connections(options.max_pool_size()?);
        config.load_balance_timeout = options.load_balance_timeout()?;
        if let Some(timeout) = options.connect_timeout()? {
            config.connection_timeout = timeout;
        }
        Ok(config)
    }

    /// Enable or disable pooling.
    #[must_use]
    pub fn pooling(mut self, enabled: bool) -> Self {
        self.pooling = enabled;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the load-balance lifetime.
    #[must_use]
    pub fn load_balance_timeout(mut self, lifetime: Duration) -> Self {
        self.load_balance_timeout = (!lifetime.is_zero()).then_some(lifetime);
        self
    }

    /// Enable or disable liveness probing on checkout.
    #[must_use]
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::Configuration(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::Configuration(
                "min_connections cannot be greater than max_connections".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the pool-group registry's pruning timer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RegistryConfig {
    /// Delay before the first prune.
    pub prune_due: Duration,

    /// Interval between prunes.
    pub prune_period: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prune_due: Duration::from_secs(4 * 60),
            prune_period: Duration::from_secs(30),
        }
    }
}

impl RegistryConfig {
    /// Create a registry configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay before the first prune.
    #[must_use]
    pub fn prune_due(mut self, due: Duration) -> Self {
        self.prune_due = due;
        self
    }

    /// Set the interval between prunes.
    #[must_use]
    pub fn prune_period(mut self, period: Duration) -> Self {
        self.prune_period = period;
        self
    }
}
