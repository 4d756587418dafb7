//! Connection pool implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use mssql_retry::{RetryContext, RetryPolicy};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::internal::{InternalConnection, Owner};
use crate::lifecycle::Connector;
use crate::metrics::PoolMetrics;
use crate::options::{ConnectionOptions, PoolKey};
use crate::transacted::TransactedPool;
use crate::transaction::{AmbientTransaction, TransactionId};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A connection pool for one option identity.
///
/// Idle connections are handed out most-recently-returned first. Connections
/// released while enlisted in a transaction are parked in a
/// [`TransactedPool`] until that transaction ends.
///
/// Idle connections sit on one of two stacks. Each [`Pool::prune_idle`]
/// pass destroys what is on the aged stack and moves the fresh stack
/// under it, so a connection is destroyed once it stayed idle for a whole
/// prune period.
pub struct Pool {
    id: u64,
    key: PoolKey,
    options: ConnectionOptions,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    metrics: Arc<PoolMetrics>,
    running: AtomicBool,
    idle: Mutex<IdleStacks>,
    objects: Mutex<Objects>,
    transacted: TransactedPool,
    returned: Notify,
}

#[derive(Default)]
struct IdleStacks {
    fresh: Vec<Arc<InternalConnection>>,
    aged: Vec<Arc<InternalConnection>>,
}

impl IdleStacks {
    fn len(&self) -> usize {
        self.fresh.len() + self.aged.len()
    }
}

#[derive(Default)]
struct Objects {
    live: Vec<Arc<InternalConnection>>,
    pending: u32,
}

/// Where a released connection goes.
enum Route {
    General,
    Parked,
    Destroy,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder(connector: Arc<dyn Connector>) -> PoolBuilder {
        PoolBuilder::new(connector)
    }

    /// Pool id, for diagnostics.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The option identity this pool serves.
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Lifetime after which released connections are not pooled again.
    #[must_use]
    pub fn load_balance_timeout(&self) -> Option<Duration> {
        self.config.load_balance_timeout
    }

    /// Check if the pool still hands out connections.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of live connections, checked out or idle.
    #[must_use]
    pub fn count(&self) -> usize {
        self.objects.lock().live.len()
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let total = self.count() as u32;
        let available = self.idle.lock().len() as u32;
        PoolStatus {
            available,
            parked: self.transacted.len() as u32,
            in_use: total.saturating_sub(available),
            total,
            max: self.config.max_connections,
        }
    }

    /// Get a connection for `owner`.
    ///
    /// Looks in the transacted pool for `transaction` first, then the idle
    /// stack. Below capacity a new connection is created through the
    /// connector under the pool's retry policy. At capacity, abandoned
    /// connections are reclaimed and the call waits for a return until
    /// `connection_timeout` elapses.
    pub async fn get(
        self: &Arc<Self>,
        owner: &Arc<Owner>,
        transaction: Option<&Arc<dyn AmbientTransaction>>,
    ) -> Result<Arc<InternalConnection>, PoolError> {
        let deadline = Instant::now() + self.config.connection_timeout;
        tracing::trace!(pool_id = self.id, "acquiring connection from pool");

        loop {
            if !self.is_running() {
                return Err(PoolError::PoolShuttingDown);
            }
            if let Some(connection) = self.take_available(transaction) {
                let connection = self.prepare_connection(connection, owner, transaction)?;
                self.fill_to_min().await;
                return Ok(connection);
            }
            if self.try_reserve() {
                let connection = self.create_object().await?;
                let connection = self.prepare_connection(connection, owner, transaction)?;
                self.fill_to_min().await;
                return Ok(connection);
            }
            if self.reclaim_emancipated() {
                continue;
            }

            tracing::trace!(pool_id = self.id, "pool at capacity, waiting for a return");
            if tokio::time::timeout_at(deadline, self.returned.notified())
                .await
                .is_err()
            {
                tracing::debug!(pool_id = self.id, "connection acquisition timed out");
                return Err(PoolError::AcquisitionTimeout(self.config.connection_timeout));
            }
        }
    }

    fn take_available(
        &self,
        transaction: Option<&Arc<dyn AmbientTransaction>>,
    ) -> Option<Arc<InternalConnection>> {
        if let Some(connection) = transaction.and_then(|tx| self.transacted.get(tx.id())) {
            return Some(connection);
        }
        while let Some(connection) = self.pop_idle() {
            if !self.config.test_on_checkout || self.probe(&connection) {
                return Some(connection);
            }
            self.destroy_object(&connection);
        }
        None
    }

    fn pop_idle(&self) -> Option<Arc<InternalConnection>> {
        let connection = {
            let mut idle = self.idle.lock();
            idle.fresh.pop().or_else(|| idle.aged.pop())
        };
        if connection.is_some() {
            self.metrics.free_popped();
        }
        connection
    }

    /// Liveness probe on checkout. A failed probe dooms the connection; a
    /// second look that finds it alive again undooms it.
    fn probe(&self, connection: &InternalConnection) -> bool {
        if connection.physical().is_alive() {
            return true;
        }
        connection.mark_doomed();
        if connection.physical().is_alive() {
            connection.undoom();
            tracing::debug!(
                pool_id = self.id,
                connection_id = connection.id(),
                "connection recovered after failed probe"
            );
            return true;
        }
        tracing::debug!(
            pool_id = self.id,
            connection_id = connection.id(),
            "discarding dead connection"
        );
        false
    }

    fn try_reserve(&self) -> bool {
        let mut objects = self.objects.lock();
        let used = objects.live.len() as u32 + objects.pending;
        if used < self.config.max_connections {
            objects.pending += 1;
            true
        } else {
            false
        }
    }

    fn below_min(&self) -> bool {
        let objects = self.objects.lock();
        objects.live.len() as u32 + objects.pending < self.config.min_connections
    }

    /// Open idle connections until the pool holds `min_connections`.
    ///
    /// Failures are logged and end the top-up; the next checkout or prune
    /// tick tries again.
    pub async fn fill_to_min(self: &Arc<Self>) {
        while self.is_running() && self.below_min() && self.try_reserve() {
            match self.create_object().await {
                Ok(connection) => {
                    tracing::trace!(
                        pool_id = self.id,
                        connection_id = connection.id(),
                        "opened connection to reach minimum pool size"
                    );
                    self.put_new_object(&connection);
                }
                Err(error) => {
                    tracing::debug!(pool_id = self.id, %error, "could not reach minimum pool size");
                    break;
                }
            }
        }
    }

    async fn create_object(self: &Arc<Self>) -> Result<Arc<InternalConnection>, PoolError> {
        let reservation = Reservation(self);
        let connector: &dyn Connector = self.connector.as_ref();
        let options = &self.options;

        let physical = self
            .retry
            .execute(&RetryContext::new(), || connector.connect(options))
            .await
            .map_err(|error| {
                tracing::warn!(pool_id = self.id, %error, "failed to create connection");
                PoolError::ConnectionCreation(error)
            })?;

        let connection = InternalConnection::new(physical, Arc::clone(&self.metrics));
        connection.make_pooled(self);
        connection.pre_push(None)?;
        self.objects.lock().live.push(Arc::clone(&connection));
        drop(reservation);

        tracing::debug!(
            pool_id = self.id,
            connection_id = connection.id(),
            "created pooled connection"
        );
        Ok(connection)
    }

    fn prepare_connection(
        self: &Arc<Self>,
        connection: Arc<InternalConnection>,
        owner: &Arc<Owner>,
        transaction: Option<&Arc<dyn AmbientTransaction>>,
    ) -> Result<Arc<InternalConnection>, PoolError> {
        connection.post_pop(owner)?;
        match connection.activate_connection(transaction) {
            Ok(()) => {
                self.metrics.soft_connect();
                Ok(connection)
            }
            Err(error @ PoolError::Activation(_)) => {
                tracing::debug!(pool_id = self.id, %error, "activation failed");
                connection.mark_doomed();
                if let Err(inner) = connection.pre_push(Some(owner)) {
                    tracing::error!(pool_id = self.id, error = %inner, "failed to release connection after activation failure");
                }
                self.deactivate_object(&connection);
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Take a connection back from `owner` and route it.
    pub fn return_connection(
        &self,
        connection: &Arc<InternalConnection>,
        owner: Option<&Arc<Owner>>,
    ) -> Result<(), PoolError> {
        connection.pre_push(owner)?;
        self.deactivate_object(connection);
        self.metrics.soft_disconnect();
        Ok(())
    }

    /// Deactivate a released connection and decide where it goes.
    fn deactivate_object(&self, connection: &Arc<InternalConnection>) {
        connection.deactivate_connection();

        let route = if connection.is_doomed() {
            Route::Destroy
        } else {
            let _guard = connection.lock();
            let physical = connection.physical();
            if !self.is_running() {
                if physical.is_transaction_root() {
                    connection.set_in_stasis();
                    Route::Parked
                } else {
                    Route::Destroy
                }
            } else if physical.is_non_poolable_transaction_root() {
                connection.set_in_stasis();
                Route::Parked
            } else if connection.can_be_pooled() {
                match connection.enlisted_transaction() {
                    Some(transaction) => {
                        self.transacted.put(&transaction, Arc::clone(connection));
                        Route::Parked
                    }
                    None => Route::General,
                }
            } else if physical.is_transaction_root() && !connection.is_doomed() {
                connection.set_in_stasis();
                Route::Parked
            } else {
                Route::Destroy
            }
        };

        match route {
            Route::General => self.put_new_object(connection),
            Route::Destroy => self.destroy_object(connection),
            Route::Parked => {}
        }
    }

    fn put_new_object(&self, connection: &Arc<InternalConnection>) {
        self.idle.lock().fresh.push(Arc::clone(connection));
        self.metrics.free_pushed();
        self.returned.notify_one();
        tracing::trace!(
            pool_id = self.id,
            connection_id = connection.id(),
            "returned connection to pool"
        );
    }

    /// Remove a connection from the pool and dispose it. Connections in
    /// stasis are left alone until their transaction ends.
    fn destroy_object(&self, connection: &Arc<InternalConnection>) {
        if connection.is_in_stasis() {
            tracing::trace!(
                pool_id = self.id,
                connection_id = connection.id(),
                "connection in stasis, destroy deferred"
            );
            return;
        }
        let removed = {
            let mut objects = self.objects.lock();
            let before = objects.live.len();
            objects.live.retain(|c| !Arc::ptr_eq(c, connection));
            before != objects.live.len()
        };
        connection.dispose();
        if removed {
            self.returned.notify_one();
        }
    }

    /// Return a connection whose transaction ended to the general pool.
    pub fn put_object_from_transacted_pool(&self, connection: &Arc<InternalConnection>) {
        connection.deactivate_connection();
        if self.is_running() && connection.can_be_pooled() {
            self.put_new_object(connection);
        } else {
            self.destroy_object(connection);
        }
    }

    /// A transaction ended; release `connection` if it was parked for it.
    pub fn transaction_ended(&self, transaction: TransactionId, connection: &Arc<InternalConnection>) {
        if self.transacted.transaction_ended(transaction, connection) {
            self.put_object_from_transacted_pool(connection);
        }
    }

    /// Take back connections whose owners vanished without closing them.
    ///
    /// Busy connections are skipped. Returns `true` if anything was
    /// reclaimed.
    pub fn reclaim_emancipated(&self) -> bool {
        let candidates = self.objects.lock().live.clone();
        let mut reclaimed = Vec::new();
        for connection in candidates {
            let Some(_guard) = connection.try_lock() else {
                continue;
            };
            if connection.is_emancipated() && connection.pre_push(None).is_ok() {
                reclaimed.push(Arc::clone(&connection));
            }
        }

        for connection in &reclaimed {
            self.metrics.reclaimed();
            tracing::debug!(
                pool_id = self.id,
                connection_id = connection.id(),
                "reclaiming abandoned connection"
            );
            if let Err(error) = connection.detach_current_transaction_if_ended() {
                tracing::error!(pool_id = self.id, %error, "failed to detach ended transaction");
            }
            self.deactivate_object(connection);
        }
        !reclaimed.is_empty()
    }

    /// Age idle connections by one prune period.
    ///
    /// Connections on the aged stack are destroyed while the pool holds more
    /// than `min_connections`; an idle transaction root goes to stasis
    /// instead. The fresh stack then becomes the aged stack.
    pub fn prune_idle(&self) {
        let min = self.config.min_connections as usize;
        let mut destroyed = 0usize;
        while self.count() > min {
            let Some(connection) = self.idle.lock().aged.pop() else {
                break;
            };
            self.metrics.free_popped();
            if connection.physical().is_transaction_root() {
                connection.set_in_stasis();
                continue;
            }
            self.destroy_object(&connection);
            destroyed += 1;
        }

        let mut idle = self.idle.lock();
        let fresh = std::mem::take(&mut idle.fresh);
        idle.aged.extend(fresh);
        tracing::trace!(
            pool_id = self.id,
            destroyed,
            aged = idle.aged.len(),
            "aged idle connections"
        );
    }

    /// Stop pooling every live connection and destroy the idle ones.
    pub fn clear(&self) {
        tracing::debug!(pool_id = self.id, "clearing pool");
        for connection in self.objects.lock().live.iter() {
            connection.mark_unpoolable();
        }
        while let Some(connection) = self.pop_idle() {
            self.destroy_object(&connection);
        }
        self.reclaim_emancipated();
    }

    /// Stop handing out connections and destroy the idle ones.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::debug!(pool_id = self.id, "pool shutting down");
            self.metrics.pool_deactivated();
        }
        while let Some(connection) = self.pop_idle() {
            self.destroy_object(&connection);
        }
        self.returned.notify_waiters();
    }
}

/// Releases a creation slot when dropped, including on cancellation.
struct Reservation<'a>(&'a Pool);

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut objects = self.0.objects.lock();
        objects.pending = objects.pending.saturating_sub(1);
        drop(objects);
        self.0.returned.notify_one();
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder(connector)
///     .options(options)
///     .max_connections(10)
///     .build()?;
///
/// let conn = pool.get(&owner, None).await?;
/// ```
pub struct PoolBuilder {
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    pool_config: Option<PoolConfig>,
    retry: RetryPolicy,
    metrics: Option<Arc<PoolMetrics>>,
}

impl PoolBuilder {
    /// Create a new pool builder.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            options: ConnectionOptions::new(),
            pool_config: None,
            retry: mssql_retry::connection_policy(),
            metrics: None,
        }
    }

    /// Set the options connections are opened with.
    #[must_use]
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the pool configuration explicitly instead of deriving it from the
    /// options.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = Some(config);
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.pool_config = Some(self.current_config().max_connections(count));
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config = Some(self.current_config().connection_timeout(timeout));
        self
    }

    /// Set the retry policy used when creating connections.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Share counters with other pools.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<PoolMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn current_config(&self) -> PoolConfig {
        match &self.pool_config {
            Some(config) => config.clone(),
            None => PoolConfig::from_options(&self.options).unwrap_or_default(),
        }
    }

    /// Build the pool.
    pub fn build(self) -> Result<Arc<Pool>, PoolError> {
        let config = match self.pool_config {
            Some(config) => config,
            None => PoolConfig::from_options(&self.options)?,
        };
        config.validate()?;

        let metrics = self.metrics.unwrap_or_default();
        metrics.pool_created();
        let pool = Arc::new(Pool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            key: self.options.pool_key(),
            options: self.options,
            config,
            connector: self.connector,
            retry: self.retry,
            metrics,
            running: AtomicBool::new(true),
            idle: Mutex::new(IdleStacks::default()),
            objects: Mutex::new(Objects::default()),
            transacted: TransactedPool::new(),
            returned: Notify::new(),
        });

        tracing::debug!(
            pool_id = pool.id,
            min = pool.config.min_connections,
            max = pool.config.max_connections,
            "connection pool created"
        );
        Ok(pool)
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: u32,
    /// Number of connections parked for a transaction.
    pub parked: u32,
    /// Number of connections not idle.
    pub in_use: u32,
    /// Total number of connections.
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::lifecycle::PhysicalConnection;
    use mssql_retry::Fault;
    use std::any::Any;
    use std::sync::atomic::AtomicU32;

    struct Counting {
        alive: AtomicBool,
    }

    impl PhysicalConnection for Counting {
        fn activate(&self, _: Option<&Arc<dyn AmbientTransaction>>) -> Result<(), Fault> {
            Ok(())
        }
        fn deactivate(&self) {}
        fn dispose(&self) {}
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Connector for CountingConnector {
        async fn connect(
            &self,
            _options: &ConnectionOptions,
        ) -> Result<Box<dyn PhysicalConnection>, Fault> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Counting {
                alive: AtomicBool::new(true),
            }))
        }
    }

    fn pool(max: u32) -> (Arc<Pool>, Arc<CountingConnector>) {
        let connector = Arc::new(CountingConnector::default());
        let pool = Pool::builder(connector.clone())
            .max_connections(max)
            .connection_timeout(Duration::from_millis(200))
            .retry_policy(RetryPolicy::none())
            .build()
            .unwrap();
        (pool, connector)
    }

    #[test]
    fn test_pool_status_utilization() {
        let status = PoolStatus {
            available: 5,
            parked: 0,
            in_use: 5,
            total: 10,
            max: 20,
        };
        assert!((status.utilization() - 25.0).abs() < f64::EPSILON);
        assert!(!status.is_at_capacity());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let connector = Arc::new(CountingConnector::default());
        let result = Pool::builder(connector).max_connections(0).build();
        assert!(matches!(result, Err(PoolError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_reuses_returned_connection() {
        let (pool, connector) = pool(1);
        let owner = Owner::new();

        let first = pool.get(&owner, None).await.unwrap();
        pool.return_connection(&first, Some(&owner)).unwrap();
        let second = pool.get(&owner, None).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(second.activation_count(), 2);
        assert_eq!(second.deactivation_count(), 1);
    }

    #[tokio::test]
    async fn test_times_out_at_capacity() {
        let (pool, _) = pool(1);
        let owner = Owner::new();
        let _held = pool.get(&owner, None).await.unwrap();

        let err = pool.get(&Owner::new(), None).await.unwrap_err();
        assert!(matches!(err, PoolError::AcquisitionTimeout(_)));
    }

    #[tokio::test]
    async fn test_waiter_receives_returned_connection() {
        let (pool, _) = pool(1);
        let owner = Owner::new();
        let held = pool.get(&owner, None).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let other = Owner::new();
                pool.get(&other, None).await.map(|c| c.id())
            })
        };
        tokio::task::yield_now().await;
        pool.return_connection(&held, Some(&owner)).unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), held.id());
    }

    #[tokio::test]
    async fn test_reclaims_abandoned_connection_at_capacity() {
        let (pool, _) = pool(1);
        let owner = Owner::new();
        let abandoned = pool.get(&owner, None).await.unwrap();
        drop(owner);

        let next = pool.get(&Owner::new(), None).await.unwrap();
        assert!(Arc::ptr_eq(&abandoned, &next));
        assert_eq!(pool.metrics.snapshot().reclaimed_connections, 1);
    }

    #[tokio::test]
    async fn test_dead_idle_connection_is_replaced() {
        let (pool, connector) = pool(2);
        let owner = Owner::new();
        let first = pool.get(&owner, None).await.unwrap();
        pool.return_connection(&first, Some(&owner)).unwrap();
        first
            .physical()
            .as_any()
            .downcast_ref::<Counting>()
            .unwrap()
            .alive
            .store(false, Ordering::SeqCst);

        let second = pool.get(&owner, None).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_disposed());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_requests_and_destroys_idle() {
        let (pool, _) = pool(2);
        let owner = Owner::new();
        let conn = pool.get(&owner, None).await.unwrap();
        pool.return_connection(&conn, Some(&owner)).unwrap();

        pool.shutdown();

        assert!(conn.is_disposed());
        assert_eq!(pool.count(), 0);
        assert!(matches!(
            pool.get(&owner, None).await.unwrap_err(),
            PoolError::PoolShuttingDown
        ));
    }

    #[tokio::test]
    async fn test_clear_discards_checked_out_on_return() {
        let (pool, _) = pool(2);
        let owner = Owner::new();
        let conn = pool.get(&owner, None).await.unwrap();

        pool.clear();
        assert!(!conn.is_disposed());

        pool.return_connection(&conn, Some(&owner)).unwrap();
        assert!(conn.is_disposed());
        assert_eq!(pool.status().available, 0);
    }

    #[tokio::test]
    async fn test_idle_connection_destroyed_after_full_prune_period() {
        let (pool, _) = pool(2);
        let owner = Owner::new();
        let conn = pool.get(&owner, None).await.unwrap();
        pool.return_connection(&conn, Some(&owner)).unwrap();

        pool.prune_idle();
        assert!(!conn.is_disposed());
        assert_eq!(pool.status().available, 1);

        pool.prune_idle();
        assert!(conn.is_disposed());
        assert_eq!(pool.count(), 0);
    }

    #[tokio::test]
    async fn test_reuse_keeps_connection_from_aging_out() {
        let (pool, connector) = pool(2);
        let owner = Owner::new();
        let conn = pool.get(&owner, None).await.unwrap();
        pool.return_connection(&conn, Some(&owner)).unwrap();

        for _ in 0..4 {
            pool.prune_idle();
            let again = pool.get(&owner, None).await.unwrap();
            assert!(Arc::ptr_eq(&conn, &again));
            pool.return_connection(&again, Some(&owner)).unwrap();
        }
        assert!(!conn.is_disposed());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_min_pool_size_filled_on_first_use_and_kept() {
        let connector = Arc::new(CountingConnector::default());
        let pool = Pool::builder(connector.clone())
            .pool_config(PoolConfig::new().min_connections(2).max_connections(5))
            .retry_policy(RetryPolicy::none())
            .build()
            .unwrap();
        let owner = Owner::new();

        let conn = pool.get(&owner, None).await.unwrap();
        assert_eq!(pool.count(), 2);
        assert_eq!(pool.status().available, 1);

        pool.return_connection(&conn, Some(&owner)).unwrap();
        for _ in 0..5 {
            pool.prune_idle();
        }
        assert_eq!(pool.count(), 2);
        assert_eq!(pool.status().available, 2);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_aging_stops_at_min_pool_size() {
        let connector = Arc::new(CountingConnector::default());
        let pool = Pool::builder(connector)
            .pool_config(PoolConfig::new().min_connections(1).max_connections(5))
            .retry_policy(RetryPolicy::none())
            .build()
            .unwrap();
        let owner = Owner::new();
        let a = pool.get(&owner, None).await.unwrap();
        let b = pool.get(&owner, None).await.unwrap();
        let c = pool.get(&owner, None).await.unwrap();
        for conn in [&a, &b, &c] {
            pool.return_connection(conn, Some(&owner)).unwrap();
        }

        pool.prune_idle();
        pool.prune_idle();
        assert_eq!(pool.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_balance_lifetime_stops_pooling() {
        let connector = Arc::new(CountingConnector::default());
        let pool = Pool::builder(connector)
            .pool_config(PoolConfig::new().load_balance_timeout(Duration::from_secs(60)))
            .retry_policy(RetryPolicy::none())
            .build()
            .unwrap();
        let owner = Owner::new();

        let conn = pool.get(&owner, None).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        pool.return_connection(&conn, Some(&owner)).unwrap();

        assert!(conn.is_unpoolable());
        assert!(conn.is_disposed());
    }
}
