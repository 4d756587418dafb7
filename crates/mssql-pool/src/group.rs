//! Pool groups.
//!
//! A group ties one option identity to at most one live [`Pool`]. Groups
//! age through `Active -> Idle -> Disabled` while they have no pool, so the
//! registry can drop identities nobody uses anymore.

use std::sync::Arc;

use mssql_retry::RetryPolicy;
use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::lifecycle::Connector;
use crate::metrics::PoolMetrics;
use crate::options::{ConnectionOptions, PoolKey};
use crate::pool::Pool;

/// Lifecycle of a [`PoolGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// In use, or recently so.
    Active,
    /// Had no pool at the last prune.
    Idle,
    /// Retired. A disabled group never hands out a pool again.
    Disabled,
}

/// One option identity and its pool.
pub struct PoolGroup {
    key: PoolKey,
    options: ConnectionOptions,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    metrics: Arc<PoolMetrics>,
    state: Mutex<GroupState>,
    pool: Mutex<Option<Arc<Pool>>>,
}

impl std::fmt::Debug for PoolGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGroup")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("has_pool", &self.pool.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl PoolGroup {
    /// Create an active group for `options`.
    pub fn new(
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
        retry: RetryPolicy,
        metrics: Arc<PoolMetrics>,
    ) -> Result<Self, PoolError> {
        let config = PoolConfig::from_options(&options)?;
        if config.pooling {
            config.validate()?;
        }
        metrics.pool_group_created();
        Ok(Self {
            key: options.pool_key(),
            options,
            config,
            connector,
            retry,
            metrics,
            state: Mutex::new(GroupState::Active),
            pool: Mutex::new(None),
        })
    }

    /// The identity this group serves.
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Options connections in this group are opened with.
    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Pool settings derived from the options.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> GroupState {
        *self.state.lock()
    }

    /// Check if the group is retired.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.state() == GroupState::Disabled
    }

    /// The current pool without creating one.
    #[must_use]
    pub fn pool(&self) -> Option<Arc<Pool>> {
        self.pool.lock().clone()
    }

    /// Get the group's pool, creating it on first use.
    ///
    /// Returns `None` when the group is disabled or pooling is off for
    /// these options. Using an idle group makes it active again.
    pub fn get_connection_pool(&self) -> Result<Option<Arc<Pool>>, PoolError> {
        if !self.config.pooling {
            return Ok(None);
        }
        let mut state = self.state.lock();
        match *state {
            GroupState::Disabled => return Ok(None),
            GroupState::Idle => {
                tracing::trace!(key = %self.key, "pool group active again");
                *state = GroupState::Active;
            }
            GroupState::Active => {}
        }

        let mut slot = self.pool.lock();
        if let Some(pool) = slot.as_ref() {
            return Ok(Some(Arc::clone(pool)));
        }
        let pool = Pool::builder(Arc::clone(&self.connector))
            .options(self.options.clone())
            .pool_config(self.config.clone())
            .retry_policy(self.retry.clone())
            .metrics(Arc::clone(&self.metrics))
            .build()?;
        *slot = Some(Arc::clone(&pool));
        Ok(Some(pool))
    }

    /// Age the pool's idle connections, release the pool if that left it
    /// empty, and age the group.
    ///
    /// Returns whether the group is now disabled, plus the pool released in
    /// this pass, if any. The released pool is already shut down.
    pub fn prune(&self) -> (bool, Option<Arc<Pool>>) {
        let mut state = self.state.lock();
        let mut slot = self.pool.lock();

        if let Some(pool) = slot.as_ref() {
            pool.prune_idle();
        }
        let released = match slot.as_ref() {
            Some(pool) if pool.count() == 0 => {
                pool.shutdown();
                slot.take()
            }
            _ => None,
        };

        if slot.is_none() {
            match *state {
                GroupState::Active => *state = GroupState::Idle,
                GroupState::Idle => {
                    tracing::debug!(key = %self.key, "pool group disabled");
                    *state = GroupState::Disabled;
                    self.metrics.pool_group_deactivated();
                }
                GroupState::Disabled => {}
            }
        }
        (*state == GroupState::Disabled, released)
    }

    /// Clear the group's pool.
    ///
    /// Returns the number of connections still alive, and the pool if it
    /// emptied and was released.
    pub fn clear(&self) -> (usize, Option<Arc<Pool>>) {
        let mut slot = self.pool.lock();
        let Some(pool) = slot.as_ref() else {
            return (0, None);
        };
        pool.clear();
        let remaining = pool.count();
        if remaining == 0 {
            pool.shutdown();
            return (0, slot.take());
        }
        (remaining, None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::lifecycle::PhysicalConnection;
    use mssql_retry::Fault;

    struct Refusing;

    #[async_trait::async_trait]
    impl Connector for Refusing {
        async fn connect(
            &self,
            _options: &ConnectionOptions,
        ) -> Result<Box<dyn PhysicalConnection>, Fault> {
            Err(Fault::ConnectionClosed)
        }
    }

    fn group(options: ConnectionOptions) -> PoolGroup {
        PoolGroup::new(
            options,
            Arc::new(Refusing),
            RetryPolicy::none(),
            Arc::new(PoolMetrics::new()),
        )
        .unwrap()
    }

    fn pooled() -> ConnectionOptions {
        ConnectionOptions::new().with("Data Source", "db1")
    }

    #[test]
    fn test_pool_created_once() {
        let group = group(pooled());
        let a = group.get_connection_pool().unwrap().unwrap();
        let b = group.get_connection_pool().unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_no_pool_when_pooling_disabled() {
        let group = group(pooled().with("Pooling", "false"));
        assert!(group.get_connection_pool().unwrap().is_none());
    }

    #[test]
    fn test_prune_ages_group_to_disabled() {
        let group = group(pooled());
        let pool = group.get_connection_pool().unwrap().unwrap();

        let (disabled, released) = group.prune();
        assert!(!disabled);
        assert!(Arc::ptr_eq(&released.unwrap(), &pool));
        assert!(!pool.is_running());
        assert_eq!(group.state(), GroupState::Idle);

        let (disabled, released) = group.prune();
        assert!(disabled);
        assert!(released.is_none());
        assert!(group.get_connection_pool().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_top_up_does_not_pin_pool() {
        let group = PoolGroup::new(
            pooled().with("Min Pool Size", "1"),
            Arc::new(Refusing),
            RetryPolicy::none(),
            Arc::new(PoolMetrics::new()),
        )
        .unwrap();
        let pool = group.get_connection_pool().unwrap().unwrap();
        pool.fill_to_min().await;
        assert_eq!(pool.count(), 0);

        let (disabled, released) = group.prune();
        assert!(!disabled);
        assert!(released.is_some());
    }

    #[test]
    fn test_use_revives_idle_group() {
        let group = group(pooled());
        group.prune();
        assert_eq!(group.state(), GroupState::Idle);

        assert!(group.get_connection_pool().unwrap().is_some());
        assert_eq!(group.state(), GroupState::Active);
    }

    #[test]
    fn test_clear_releases_empty_pool() {
        let group = group(pooled());
        assert!(matches!(group.clear(), (0, None)));

        let pool = group.get_connection_pool().unwrap().unwrap();
        let (remaining, released) = group.clear();
        assert_eq!(remaining, 0);
        assert!(Arc::ptr_eq(&released.unwrap(), &pool));
        assert!(group.pool().is_none());
    }
}
