//! Pool lifecycle counters.
//!
//! One [`PoolMetrics`] is shared by every pool group, pool and connection
//! opened through a registry. Counters are lock-free and may be read at any
//! time through [`PoolMetrics::snapshot`].

use std::sync::atomic::{AtomicI64, Ordering};

/// Live counters for pool lifecycle events.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    active_connections: AtomicI64,
    stasis_connections: AtomicI64,
    pooled_connections: AtomicI64,
    non_pooled_connections: AtomicI64,
    free_connections: AtomicI64,
    reclaimed_connections: AtomicI64,
    hard_connects: AtomicI64,
    hard_disconnects: AtomicI64,
    soft_connects: AtomicI64,
    soft_disconnects: AtomicI64,
    active_pool_groups: AtomicI64,
    inactive_pool_groups: AtomicI64,
    active_pools: AtomicI64,
    inactive_pools: AtomicI64,
}

#[inline]
fn inc(counter: &AtomicI64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn dec(counter: &AtomicI64) {
    counter.fetch_sub(1, Ordering::Relaxed);
}

impl PoolMetrics {
    /// Create a zeroed set of counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection was handed to an owner.
    pub fn enter_active(&self, connection_id: u64) {
        inc(&self.active_connections);
        tracing::trace!(connection_id, "connection entered active state");
    }

    /// A connection was taken back from its owner.
    pub fn exit_active(&self, connection_id: u64) {
        dec(&self.active_connections);
        tracing::trace!(connection_id, "connection exited active state");
    }

    /// A connection began waiting for its transaction to end.
    pub fn enter_stasis(&self, connection_id: u64) {
        inc(&self.stasis_connections);
        tracing::debug!(connection_id, "connection entered stasis");
    }

    /// A connection stopped waiting for its transaction.
    pub fn exit_stasis(&self, connection_id: u64) {
        dec(&self.stasis_connections);
        tracing::debug!(connection_id, "connection exited stasis");
    }

    /// A physical connection was established.
    pub fn hard_connect(&self) {
        inc(&self.hard_connects);
    }

    /// A physical connection was torn down.
    pub fn hard_disconnect(&self) {
        inc(&self.hard_disconnects);
    }

    /// A pooled connection was handed out.
    pub fn soft_connect(&self) {
        inc(&self.soft_connects);
    }

    /// A pooled connection was returned.
    pub fn soft_disconnect(&self) {
        inc(&self.soft_disconnects);
    }

    pub(crate) fn pooled_created(&self) {
        inc(&self.pooled_connections);
    }

    pub(crate) fn pooled_destroyed(&self) {
        dec(&self.pooled_connections);
    }

    pub(crate) fn non_pooled_created(&self) {
        inc(&self.non_pooled_connections);
    }

    pub(crate) fn non_pooled_destroyed(&self) {
        dec(&self.non_pooled_connections);
    }

    pub(crate) fn free_pushed(&self) {
        inc(&self.free_connections);
    }

    pub(crate) fn free_popped(&self) {
        dec(&self.free_connections);
    }

    pub(crate) fn reclaimed(&self) {
        inc(&self.reclaimed_connections);
    }

    pub(crate) fn pool_group_created(&self) {
        inc(&self.active_pool_groups);
    }

    pub(crate) fn pool_group_deactivated(&self) {
        dec(&self.active_pool_groups);
        inc(&self.inactive_pool_groups);
    }

    pub(crate) fn pool_group_released(&self) {
        dec(&self.inactive_pool_groups);
    }

    pub(crate) fn pool_created(&self) {
        inc(&self.active_pools);
    }

    pub(crate) fn pool_deactivated(&self) {
        dec(&self.active_pools);
        inc(&self.inactive_pools);
    }

    pub(crate) fn pool_released(&self) {
        dec(&self.inactive_pools);
    }

    /// Copy the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicI64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            active_connections: load(&self.active_connections),
            stasis_connections: load(&self.stasis_connections),
            pooled_connections: load(&self.pooled_connections),
            non_pooled_connections: load(&self.non_pooled_connections),
            free_connections: load(&self.free_connections),
            reclaimed_connections: load(&self.reclaimed_connections),
            hard_connects: load(&self.hard_connects),
            hard_disconnects: load(&self.hard_disconnects),
            soft_connects: load(&self.soft_connects),
            soft_disconnects: load(&self.soft_disconnects),
            active_pool_groups: load(&self.active_pool_groups),
            inactive_pool_groups: load(&self.inactive_pool_groups),
            active_pools: load(&self.active_pools),
            inactive_pools: load(&self.inactive_pools),
        }
    }
}

/// Point-in-time copy of [`PoolMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Connections currently handed to an owner.
    pub active_connections: i64,
    /// Connections waiting for a transaction to end.
    pub stasis_connections: i64,
    /// Live connections that belong to a pool.
    pub pooled_connections: i64,
    /// Live connections opened without pooling.
    pub non_pooled_connections: i64,
    /// Connections sitting idle in a pool.
    pub free_connections: i64,
    /// Abandoned connections taken back by the pool.
    pub reclaimed_connections: i64,
    /// Physical connects.
    pub hard_connects: i64,
    /// Physical disconnects.
    pub hard_disconnects: i64,
    /// Pool checkouts.
    pub soft_connects: i64,
    /// Pool checkins.
    pub soft_disconnects: i64,
    /// Pool groups in use.
    pub active_pool_groups: i64,
    /// Pool groups queued for release.
    pub inactive_pool_groups: i64,
    /// Pools in use.
    pub active_pools: i64,
    /// Pools queued for release.
    pub inactive_pools: i64,
}

impl MetricsSnapshot {
    /// Physical connections currently alive.
    #[must_use]
    pub fn live_connections(&self) -> i64 {
        self.hard_connects - self.hard_disconnects
    }
}
