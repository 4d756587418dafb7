//! Registry of pool groups.
//!
//! The registry is the entry point for opening connections. It maps each
//! option identity to a [`PoolGroup`] and runs a periodic prune that ages
//! idle connections and retires empty pools and groups over two cycles.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use mssql_retry::{RetryContext, RetryPolicy};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::RegistryConfig;
use crate::error::{InternalError, PoolError};
use crate::group::PoolGroup;
use crate::internal::{InternalConnection, Owner};
use crate::lifecycle::Connector;
use crate::metrics::PoolMetrics;
use crate::options::{ConnectionOptions, PoolKey};
use crate::pool::Pool;
use crate::transaction::AmbientTransaction;

/// Bound on each lock the prune sweep takes. A sweep that cannot get a
/// lock in time skips that phase until the next tick.
const PRUNE_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// How many times `open` looks a group up again after finding it disabled.
const MAX_GROUP_LOOKUPS: usize = 3;

/// Map from option identity to pool group.
pub struct PoolGroupRegistry {
    groups: RwLock<HashMap<PoolKey, Arc<PoolGroup>>>,
    pools_to_release: Mutex<Vec<Arc<Pool>>>,
    groups_to_release: Mutex<Vec<Arc<PoolGroup>>>,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    metrics: Arc<PoolMetrics>,
    config: RegistryConfig,
}

impl std::fmt::Debug for PoolGroupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGroupRegistry")
            .field("groups", &self.group_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PoolGroupRegistry {
    /// Create a registry that opens physical connections through
    /// `connector`, retrying with the process-wide connection policy.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            pools_to_release: Mutex::new(Vec::new()),
            groups_to_release: Mutex::new(Vec::new()),
            connector,
            retry: mssql_retry::connection_policy(),
            metrics: Arc::new(PoolMetrics::new()),
            config: RegistryConfig::default(),
        }
    }

    /// Set the prune schedule.
    #[must_use]
    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the retry policy used when creating physical connections.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Share counters with another registry.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<PoolMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Counters for everything opened through this registry.
    #[must_use]
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// Number of groups in the active map.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Pools waiting to be released.
    #[must_use]
    pub fn pending_pool_releases(&self) -> usize {
        self.pools_to_release.lock().len()
    }

    /// Groups waiting to be released.
    #[must_use]
    pub fn pending_group_releases(&self) -> usize {
        self.groups_to_release.lock().len()
    }

    /// Look up the group for `options` without creating one.
    #[must_use]
    pub fn pool_group(&self, options: &ConnectionOptions) -> Option<Arc<PoolGroup>> {
        self.groups.read().get(&options.pool_key()).cloned()
    }

    /// Get the group for `options`, creating it if needed.
    ///
    /// A disabled group is replaced by a fresh one, so the result is never
    /// disabled at the time of the call.
    pub fn get_or_create_pool_group(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Arc<PoolGroup>, PoolError> {
        let key = options.pool_key();
        if let Some(group) = self.groups.read().get(&key) {
            if !group.is_disabled() {
                return Ok(Arc::clone(group));
            }
        }

        let mut groups = self.groups.write();
        if let Some(group) = groups.get(&key) {
            if !group.is_disabled() {
                return Ok(Arc::clone(group));
            }
        }

        let group = Arc::new(PoolGroup::new(
            options.clone(),
            Arc::clone(&self.connector),
            self.retry.clone(),
            Arc::clone(&self.metrics),
        )?);
        tracing::debug!(key = %key, "created pool group");
        if let Some(stale) = groups.insert(key, Arc::clone(&group)) {
            self.groups_to_release.lock().push(stale);
        }
        Ok(group)
    }

    /// Get an activated internal connection for `owner`.
    ///
    /// Pooled options go through the group's pool. With pooling off a new
    /// physical connection is opened for this owner alone.
    pub async fn open(
        &self,
        options: &ConnectionOptions,
        owner: &Arc<Owner>,
        transaction: Option<&Arc<dyn AmbientTransaction>>,
    ) -> Result<Arc<InternalConnection>, PoolError> {
        let mut group = self.get_or_create_pool_group(options)?;
        if !group.config().pooling {
            return self.open_non_pooled(options, owner, transaction).await;
        }

        for _ in 0..MAX_GROUP_LOOKUPS {
            match group.get_connection_pool()? {
                Some(pool) => return pool.get(owner, transaction).await,
                None => {
                    tracing::debug!(key = %group.key(), "pool group disabled during open, retrying lookup");
                    group = self.get_or_create_pool_group(options)?;
                }
            }
        }
        tracing::error!(key = %group.key(), "no usable pool group");
        Err(InternalError::PoolGroupDisabled.into())
    }

    async fn open_non_pooled(
        &self,
        options: &ConnectionOptions,
        owner: &Arc<Owner>,
        transaction: Option<&Arc<dyn AmbientTransaction>>,
    ) -> Result<Arc<InternalConnection>, PoolError> {
        let connector: &dyn Connector = self.connector.as_ref();
        let physical = self
            .retry
            .execute(&RetryContext::new(), || connector.connect(options))
            .await
            .map_err(PoolError::ConnectionCreation)?;

        let connection = InternalConnection::new(physical, Arc::clone(&self.metrics));
        connection.make_non_pooled(owner);
        if let Err(error) = connection.activate_connection(transaction) {
            connection.mark_doomed();
            if let Err(inner) = connection.close_connection(owner) {
                tracing::error!(connection_id = connection.id(), error = %inner, "failed to release connection after activation failure");
            }
            return Err(error);
        }
        tracing::debug!(connection_id = connection.id(), "opened non-pooled connection");
        Ok(connection)
    }

    /// Clear the pool for `options`, if it has one.
    pub fn clear_pool(&self, options: &ConnectionOptions) {
        if let Some(group) = self.pool_group(options) {
            self.clear_group(&group);
        }
    }

    /// Clear every pool in the registry.
    pub fn clear_all_pools(&self) {
        let groups: Vec<_> = self.groups.read().values().cloned().collect();
        for group in &groups {
            self.clear_group(group);
        }
    }

    fn clear_group(&self, group: &PoolGroup) {
        let (remaining, released) = group.clear();
        tracing::debug!(key = %group.key(), remaining, "cleared pool");
        if let Some(pool) = released {
            self.pools_to_release.lock().push(pool);
        }
    }

    /// One prune sweep.
    ///
    /// 1. Release queued pools that have no live connections left.
    /// 2. Release queued groups that no longer hold a pool.
    /// 3. Prune every active group, which ages its idle connections; queue
    ///    the pools they release and move disabled groups out of the active
    ///    map.
    pub fn prune(&self) {
        tracing::trace!("pruning pool groups");

        if let Some(mut pools) = self.pools_to_release.try_lock_for(PRUNE_LOCK_TIMEOUT) {
            pools.retain(|pool| {
                pool.clear();
                if pool.count() == 0 {
                    tracing::debug!(pool_id = pool.id(), "released pool");
                    self.metrics.pool_released();
                    false
                } else {
                    true
                }
            });
        }

        if let Some(mut groups) = self.groups_to_release.try_lock_for(PRUNE_LOCK_TIMEOUT) {
            let mut released_pools = Vec::new();
            groups.retain(|group| {
                let (_, released) = group.prune();
                released_pools.extend(released);
                if group.pool().is_none() {
                    tracing::debug!(key = %group.key(), "released pool group");
                    self.metrics.pool_group_released();
                    false
                } else {
                    true
                }
            });
            drop(groups);
            self.queue_pools(released_pools);
        }

        if let Some(mut active) = self.groups.try_write_for(PRUNE_LOCK_TIMEOUT) {
            let mut released_pools = Vec::new();
            let mut retired = Vec::new();
            active.retain(|_, group| {
                let (disabled, released) = group.prune();
                released_pools.extend(released);
                if disabled {
                    retired.push(Arc::clone(group));
                }
                !disabled
            });
            drop(active);
            self.queue_pools(released_pools);
            if !retired.is_empty() {
                self.groups_to_release.lock().extend(retired);
            }
        }
    }

    /// Bring every active pool back up to its minimum size.
    pub async fn replenish(&self) {
        let pools: Vec<Arc<Pool>> = self
            .groups
            .read()
            .values()
            .filter_map(|group| group.pool())
            .collect();
        for pool in pools {
            pool.fill_to_min().await;
        }
    }

    fn queue_pools(&self, pools: Vec<Arc<Pool>>) {
        if !pools.is_empty() {
            self.pools_to_release.lock().extend(pools);
        }
    }

    /// Start the periodic prune on the current tokio runtime.
    ///
    /// The first sweep runs after `prune_due`, then every `prune_period`.
    /// The task stops when the returned handle is dropped or the registry
    /// goes away.
    #[must_use = "dropping the handle stops pruning"]
    pub fn start_pruning(self: &Arc<Self>) -> PruneTask {
        let registry: Weak<Self> = Arc::downgrade(self);
        let due = tokio::time::Instant::now() + self.config.prune_due;
        let period = self.config.prune_period;

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(due, period);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.prune();
                registry.replenish().await;
            }
        });
        PruneTask { handle }
    }
}

/// Handle to a background prune task. Dropping it stops the task.
#[derive(Debug)]
pub struct PruneTask {
    handle: JoinHandle<()>,
}

impl PruneTask {
    /// Stop pruning.
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for PruneTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
