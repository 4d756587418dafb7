//! Per-connection lifecycle state machine.
//!
//! An [`InternalConnection`] wraps one physical connection and tracks
//! everything the pool needs to know about it: whether it sits in a pool,
//! who owns it, whether it is doomed, and whether it is waiting for a
//! delegated transaction to end ("stasis").
//!
//! ```text
//! Idle(pooled) --activate--> Active --deactivate--> Idle(pooled)
//!                                               \-> Idle(unpooled, stasis)
//!                                                      --tx completes--> Disposed | Idle(pooled)
//! ```
//!
//! Doom is an overlay: a doomed connection is disposed at the next
//! opportunity, whatever its pooling status.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tokio::time::Instant;

use crate::error::{InternalError, PoolError};
use crate::lifecycle::{ConnectionState, PhysicalConnection};
use crate::metrics::PoolMetrics;
use crate::pool::Pool;
use crate::references::{Dependent, ReferenceTracker};
use crate::transaction::{self, AmbientTransaction, TransactionId, TransactionStatus};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a logical connection that may own an internal connection.
///
/// Internal connections hold only a weak reference to their owner. Dropping
/// every strong reference without closing abandons the internal connection,
/// which the pool later reclaims.
#[derive(Debug)]
pub struct Owner {
    id: u64,
}

impl Owner {
    /// Create a new owner identity.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Process-unique id, for diagnostics.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Fields mutated together under the lifecycle lock.
struct Lifecycle {
    /// `1` in a pool, `0` popped, `-1` never pooled.
    pooled_count: i32,
    owner: Option<Weak<Owner>>,
    pool: Option<Weak<Pool>>,
    enlisted: Option<Arc<dyn AmbientTransaction>>,
    enlisted_original: Option<Arc<dyn AmbientTransaction>>,
    state: ConnectionState,
}

impl Lifecycle {
    fn live_owner(&self) -> Option<Arc<Owner>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }
}

/// A physical connection plus its pooling state.
pub struct InternalConnection {
    id: u64,
    created_at: Instant,
    physical: Box<dyn PhysicalConnection>,
    references: ReferenceTracker,
    metrics: Arc<PoolMetrics>,
    lock: ReentrantMutex<()>,
    fields: Mutex<Lifecycle>,
    doomed: AtomicBool,
    cannot_be_pooled: AtomicBool,
    in_stasis: AtomicBool,
    active: AtomicBool,
    disposed: AtomicBool,
    activations: AtomicU64,
    deactivations: AtomicU64,
}

impl std::fmt::Debug for InternalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalConnection")
            .field("id", &self.id)
            .field("pooled_count", &self.pooled_count())
            .field("doomed", &self.is_doomed())
            .field("in_stasis", &self.is_in_stasis())
            .finish_non_exhaustive()
    }
}

impl InternalConnection {
    /// Wrap a freshly established physical connection.
    pub fn new(physical: Box<dyn PhysicalConnection>, metrics: Arc<PoolMetrics>) -> Arc<Self> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        metrics.hard_connect();
        tracing::debug!(connection_id = id, "physical connection established");
        Arc::new(Self {
            id,
            created_at: Instant::now(),
            physical,
            references: ReferenceTracker::new(),
            metrics,
            lock: ReentrantMutex::new(()),
            fields: Mutex::new(Lifecycle {
                pooled_count: 0,
                owner: None,
                pool: None,
                enlisted: None,
                enlisted_original: None,
                state: ConnectionState::Closed,
            }),
            doomed: AtomicBool::new(false),
            cannot_be_pooled: AtomicBool::new(false),
            in_stasis: AtomicBool::new(false),
            active: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            activations: AtomicU64::new(0),
            deactivations: AtomicU64::new(0),
        })
    }

    /// Process-unique id, for diagnostics.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the physical connection was established.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The wrapped physical connection.
    #[must_use]
    pub fn physical(&self) -> &dyn PhysicalConnection {
        self.physical.as_ref()
    }

    /// Open while activated, closed otherwise.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.fields.lock().state
    }

    /// Take the lifecycle lock. Reentrant on the same thread.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Take the lifecycle lock if it is free.
    pub fn try_lock(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        self.lock.try_lock()
    }

    // ---- pool membership ----

    pub(crate) fn make_pooled(&self, pool: &Arc<Pool>) {
        self.fields.lock().pool = Some(Arc::downgrade(pool));
        self.metrics.pooled_created();
    }

    pub(crate) fn make_non_pooled(&self, owner: &Arc<Owner>) {
        let mut fields = self.fields.lock();
        fields.pool = None;
        fields.owner = Some(Arc::downgrade(owner));
        fields.pooled_count = -1;
        drop(fields);
        self.metrics.non_pooled_created();
    }

    /// The pool this connection belongs to, if it is pooled and the pool is
    /// still alive.
    #[must_use]
    pub fn pool(&self) -> Option<Arc<Pool>> {
        self.fields.lock().pool.as_ref().and_then(Weak::upgrade)
    }

    fn is_pooled(&self) -> bool {
        self.fields.lock().pool.is_some()
    }

    /// `1` in a pool, `0` checked out, `-1` never pooled.
    #[must_use]
    pub fn pooled_count(&self) -> i32 {
        self.fields.lock().pooled_count
    }

    /// Check if the connection currently sits in a pool.
    #[must_use]
    pub fn is_in_pool(&self) -> bool {
        self.pooled_count() == 1
    }

    /// The live owner, if any.
    #[must_use]
    pub fn owner(&self) -> Option<Arc<Owner>> {
        self.fields.lock().live_owner()
    }

    fn has_owner(&self) -> bool {
        self.owner().is_some()
    }

    /// Record that the connection is going back into a pool.
    ///
    /// `expected_owner` is the owner handing it back, or `None` when the pool
    /// reclaims or first publishes it.
    pub fn pre_push(&self, expected_owner: Option<&Arc<Owner>>) -> Result<(), InternalError> {
        let _guard = self.lock.lock();
        let mut fields = self.fields.lock();
        match (expected_owner, fields.live_owner()) {
            (None, Some(_)) => return Err(self.fail(InternalError::UnpooledObjectHasOwner)),
            (Some(expected), Some(current)) if !Arc::ptr_eq(expected, &current) => {
                return Err(self.fail(InternalError::UnpooledObjectHasWrongOwner));
            }
            _ => {}
        }
        if fields.pooled_count != 0 {
            return Err(self.fail(InternalError::PushingObjectSecondTime));
        }
        fields.pooled_count += 1;
        fields.owner = None;
        Ok(())
    }

    /// Record that the connection left its pool for `new_owner`.
    pub fn post_pop(&self, new_owner: &Arc<Owner>) -> Result<(), InternalError> {
        let _guard = self.lock.lock();
        let mut fields = self.fields.lock();
        if fields.live_owner().is_some() {
            return Err(self.fail(InternalError::PooledObjectHasOwner));
        }
        let next = fields.pooled_count - 1;
        if fields.pool.is_some() {
            if next != 0 {
                return Err(self.fail(InternalError::PooledObjectInPoolMoreThanOnce));
            }
        } else if next != -1 {
            return Err(self.fail(InternalError::NonPooledObjectUsedMoreThanOnce));
        }
        fields.pooled_count = next;
        fields.owner = Some(Arc::downgrade(new_owner));
        Ok(())
    }

    fn fail(&self, error: InternalError) -> InternalError {
        tracing::error!(connection_id = self.id, %error, "pool bookkeeping violated");
        error
    }

    // ---- flags ----

    /// Check if the connection must be destroyed on release.
    #[must_use]
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::Acquire)
    }

    /// Never return this connection to a pool.
    pub fn mark_doomed(&self) {
        if !self.doomed.swap(true, Ordering::AcqRel) {
            tracing::debug!(connection_id = self.id, "connection doomed");
        }
    }

    /// Reverse [`mark_doomed`](Self::mark_doomed) after a transient probe
    /// failure.
    pub fn undoom(&self) {
        if self.doomed.swap(false, Ordering::AcqRel) {
            tracing::debug!(connection_id = self.id, "connection undoomed");
        }
    }

    /// Finish the current use normally but never pool the connection again.
    pub fn mark_unpoolable(&self) {
        self.cannot_be_pooled.store(true, Ordering::Release);
    }

    /// Check if [`mark_unpoolable`](Self::mark_unpoolable) was called.
    #[must_use]
    pub fn is_unpoolable(&self) -> bool {
        self.cannot_be_pooled.load(Ordering::Acquire)
    }

    /// Check if the connection may go back into the general pool.
    #[must_use]
    pub fn can_be_pooled(&self) -> bool {
        !self.is_doomed() && !self.is_unpoolable() && !self.has_owner()
    }

    /// Check if the connection waits for a delegated transaction to end.
    #[must_use]
    pub fn is_in_stasis(&self) -> bool {
        self.in_stasis.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_stasis(&self) {
        if !self.in_stasis.swap(true, Ordering::AcqRel) {
            self.metrics.enter_stasis(self.id);
        }
    }

    fn terminate_stasis(&self, returning_to_pool: bool) {
        if self.in_stasis.swap(false, Ordering::AcqRel) {
            self.metrics.exit_stasis(self.id);
            if returning_to_pool {
                tracing::debug!(connection_id = self.id, "delegated transaction ended, returning to pool");
            } else {
                tracing::debug!(connection_id = self.id, "delegated transaction ended, disposing");
            }
        }
    }

    /// Abandoned: out of the pool, unowned, and not in stasis.
    #[must_use]
    pub fn is_emancipated(&self) -> bool {
        let fields = self.fields.lock();
        !self.is_in_stasis() && fields.pooled_count < 1 && fields.live_owner().is_none()
    }

    /// Check if [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of activations so far.
    #[must_use]
    pub fn activation_count(&self) -> u64 {
        self.activations.load(Ordering::Acquire)
    }

    /// Number of physical deactivations so far.
    #[must_use]
    pub fn deactivation_count(&self) -> u64 {
        self.deactivations.load(Ordering::Acquire)
    }

    // ---- activation ----

    /// Hand the connection to a new owner, joining `transaction` if given.
    ///
    /// Activating twice without a deactivation in between is a pool bug.
    pub fn activate_connection(
        self: &Arc<Self>,
        transaction: Option<&Arc<dyn AmbientTransaction>>,
    ) -> Result<(), PoolError> {
        let _guard = self.lock.lock();
        if self.active.swap(true, Ordering::AcqRel) {
            return Err(self.fail(InternalError::ActivatedTwice).into());
        }
        self.activations.fetch_add(1, Ordering::AcqRel);
        self.metrics.enter_active(self.id);
        self.fields.lock().state = ConnectionState::Open;

        self.physical.activate(transaction).map_err(PoolError::Activation)?;
        if let Some(transaction) = transaction {
            self.set_enlisted_transaction(Some(transaction));
        }
        Ok(())
    }

    /// Take the connection back from its owner.
    ///
    /// Marks the connection unpoolable if it outlived the pool's
    /// load-balance timeout.
    pub(crate) fn deactivate_connection(&self) {
        let _guard = self.lock.lock();
        if !self.is_doomed() {
            let lifetime = self.pool().and_then(|pool| pool.load_balance_timeout());
            if lifetime.is_some_and(|lifetime| self.created_at.elapsed() > lifetime) {
                tracing::debug!(connection_id = self.id, "load-balance lifetime exceeded");
                self.mark_unpoolable();
            }
        }
        self.deactivate();
    }

    /// Physical deactivation. Runs once per activation; extra calls do
    /// nothing.
    fn deactivate(&self) {
        let _guard = self.lock.lock();
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.deactivations.fetch_add(1, Ordering::AcqRel);
        self.metrics.exit_active(self.id);
        self.references.notify_all_and_clear();
        self.physical.deactivate();
        self.fields.lock().state = ConnectionState::Closed;
    }

    /// Release the connection on behalf of `owner`.
    ///
    /// Pooled connections go back through their pool. Non-pooled ones are
    /// deactivated and then either wait for their delegated transaction or
    /// are disposed.
    pub fn close_connection(self: &Arc<Self>, owner: &Arc<Owner>) -> Result<(), PoolError> {
        let _guard = self.lock.lock();
        self.detach_current_transaction_if_ended()?;

        if self.is_pooled() {
            match self.pool() {
                Some(pool) => pool.return_connection(self, Some(owner))?,
                None => {
                    tracing::debug!(connection_id = self.id, "pool is gone, disposing");
                    self.deactivate();
                    self.dispose();
                }
            }
            return Ok(());
        }

        self.deactivate();
        self.fields.lock().owner = None;
        if self.physical.is_transaction_root() {
            self.set_in_stasis();
        } else {
            self.dispose();
        }
        Ok(())
    }

    /// Tear the connection down. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.doomed.store(true, Ordering::Release);
        let was_pooled = {
            let mut fields = self.fields.lock();
            fields.enlisted = None;
            fields.enlisted_original = None;
            fields.state = ConnectionState::Closed;
            fields.pool.take().is_some()
        };
        self.physical.dispose();
        self.metrics.hard_disconnect();
        if was_pooled {
            self.metrics.pooled_destroyed();
        } else {
            self.metrics.non_pooled_destroyed();
        }
        tracing::debug!(connection_id = self.id, "connection disposed");
    }

    // ---- transactions ----

    /// The transaction this connection is bound to, if any.
    #[must_use]
    pub fn enlisted_transaction(&self) -> Option<Arc<dyn AmbientTransaction>> {
        self.fields.lock().enlisted.clone()
    }

    /// Check if the caller's transaction handle was disposed.
    #[must_use]
    pub fn enlisted_transaction_disposed(&self) -> bool {
        self.fields
            .lock()
            .enlisted_original
            .as_ref()
            .is_some_and(|original| original.status().is_err())
    }

    /// Join `transaction` on the server and bind to it, or leave the current
    /// one with `None`.
    pub fn enlist_transaction(
        self: &Arc<Self>,
        transaction: Option<&Arc<dyn AmbientTransaction>>,
    ) -> Result<(), PoolError> {
        let _guard = self.lock.lock();
        self.physical.enlist(transaction).map_err(PoolError::Activation)?;
        self.set_enlisted_transaction(transaction);
        Ok(())
    }

    /// Replace the transaction binding.
    ///
    /// Stores a cloned handle, then subscribes to completion once the swap
    /// is recorded.
    fn set_enlisted_transaction(self: &Arc<Self>, transaction: Option<&Arc<dyn AmbientTransaction>>) {
        let current = self.enlisted_transaction().map(|t| t.id());
        if current == transaction.map(|t| t.id()) {
            return;
        }

        let clone = transaction.map(|t| t.clone_handle());
        {
            let _guard = self.lock.lock();
            let mut fields = self.fields.lock();
            fields.enlisted = clone.clone();
            fields.enlisted_original = transaction.cloned();
        }

        if let Some(clone) = clone {
            tracing::trace!(connection_id = self.id, transaction = %clone.id(), "enlisted");
            // The subscription keeps the connection alive until the
            // transaction ends; a connection in stasis has no other owner.
            let connection = Arc::clone(self);
            clone.on_completed(Box::new(move |id, status| {
                connection.on_transaction_completed(id, status);
            }));
        }
    }

    fn on_transaction_completed(self: &Arc<Self>, id: TransactionId, status: TransactionStatus) {
        tracing::trace!(connection_id = self.id, transaction = %id, ?status, "transaction completed");
        if let Err(error) = self.cleanup_on_transaction_completion(id) {
            tracing::error!(connection_id = self.id, %error, "transaction completion cleanup failed");
        }
    }

    /// Drop the binding to `id` and let the pool release anything it held
    /// for that transaction.
    pub(crate) fn cleanup_on_transaction_completion(
        self: &Arc<Self>,
        id: TransactionId,
    ) -> Result<(), PoolError> {
        self.detach_transaction(id, false)?;
        if let Some(pool) = self.pool() {
            pool.transaction_ended(id, self);
        }
        Ok(())
    }

    /// Detach from the bound transaction if it is no longer active.
    pub(crate) fn detach_current_transaction_if_ended(self: &Arc<Self>) -> Result<(), PoolError> {
        let Some(enlisted) = self.enlisted_transaction() else {
            return Ok(());
        };
        if !transaction::is_active(enlisted.as_ref()) {
            self.detach_transaction(enlisted.id(), true)?;
        }
        Ok(())
    }

    /// Clear the binding to transaction `id`, ending stasis if the
    /// connection was waiting for it.
    ///
    /// Runs under the lifecycle lock so it cannot interleave with an
    /// enlistment swap.
    pub(crate) fn detach_transaction(
        self: &Arc<Self>,
        id: TransactionId,
        explicitly_releasing: bool,
    ) -> Result<(), PoolError> {
        let _guard = self.lock.lock();
        if !(explicitly_releasing
            || self.physical.unbind_on_transaction_completion()
            || !self.has_owner())
        {
            return Ok(());
        }

        let detached = {
            let mut fields = self.fields.lock();
            if fields.enlisted.as_ref().is_some_and(|t| t.id() == id) {
                fields.enlisted = None;
                fields.enlisted_original = None;
                true
            } else {
                false
            }
        };
        if detached {
            tracing::trace!(connection_id = self.id, transaction = %id, "detached from transaction");
            if self.is_in_stasis() {
                self.delegated_transaction_ended()?;
            }
        }
        Ok(())
    }

    /// Leave stasis: back to the general pool if pooled, disposed if
    /// non-pooled and abandoned.
    fn delegated_transaction_ended(self: &Arc<Self>) -> Result<(), PoolError> {
        let _guard = self.lock.lock();
        match self.pooled_count() {
            1 => {
                self.terminate_stasis(true);
                self.deactivate();
                let pool = self
                    .pool()
                    .ok_or_else(|| self.fail(InternalError::PooledObjectWithoutPool))?;
                pool.put_object_from_transacted_pool(self);
            }
            -1 if !self.has_owner() => {
                self.terminate_stasis(false);
                self.deactivate();
                self.dispose();
            }
            _ => {}
        }
        Ok(())
    }

    // ---- dependents ----

    /// Track a dependent that must hear about deactivation.
    pub fn add_dependent<T: Dependent>(&self, dependent: &Arc<T>, tag: i32) {
        self.references.add(dependent, tag);
    }

    /// Stop tracking a dependent.
    pub fn remove_dependent<T: Dependent + ?Sized>(&self, dependent: &Arc<T>) {
        self.references.remove(dependent);
    }

    /// Find a tracked dependent by tag and predicate.
    pub fn find_dependent<F>(&self, tag: i32, predicate: F) -> Option<Arc<dyn Dependent>>
    where
        F: Fn(&dyn Dependent) -> bool,
    {
        self.references.find(tag, predicate)
    }
}
