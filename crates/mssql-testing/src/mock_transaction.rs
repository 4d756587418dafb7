//! Mock ambient transactions.
//!
//! Every handle returned by `clone_handle` shares one underlying
//! transaction, so completing any of them notifies all subscribers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use mssql_driver_pool::{
    AmbientTransaction, CompletionCallback, TransactionError, TransactionId, TransactionStatus,
};
use parking_lot::Mutex;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct Shared {
    status: Mutex<Option<TransactionStatus>>,
    subscribers: Mutex<Vec<CompletionCallback>>,
}

/// An in-memory ambient transaction.
pub struct MockTransaction {
    id: TransactionId,
    shared: Arc<Shared>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for MockTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransaction")
            .field("id", &self.id)
            .field("status", &*self.shared.status.lock())
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MockTransaction {
    /// Start a new active transaction.
    #[must_use]
    pub fn begin() -> Arc<Self> {
        Arc::new(Self {
            id: TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed)),
            shared: Arc::new(Shared::default()),
            disposed: AtomicBool::new(false),
        })
    }

    /// This handle as a trait object.
    #[must_use]
    pub fn handle(self: &Arc<Self>) -> Arc<dyn AmbientTransaction> {
        Arc::clone(self) as Arc<dyn AmbientTransaction>
    }

    /// Finish the transaction and notify every subscriber once.
    ///
    /// The status is published under the subscriber lock, so a concurrent
    /// `on_completed` is either drained here or sees the status.
    pub fn complete(&self, status: TransactionStatus) {
        let subscribers = {
            let mut pending = self.shared.subscribers.lock();
            *self.shared.status.lock() = Some(status);
            std::mem::take(&mut *pending)
        };
        tracing::trace!(transaction = %self.id, ?status, subscribers = subscribers.len(), "mock transaction completed");
        for callback in subscribers {
            callback(self.id, status);
        }
    }

    /// Commit.
    pub fn commit(&self) {
        self.complete(TransactionStatus::Committed);
    }

    /// Roll back.
    pub fn rollback(&self) {
        self.complete(TransactionStatus::Aborted);
    }

    /// Dispose this handle. Its status queries fail afterwards; clones are
    /// unaffected.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    /// Number of pending completion subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }
}

impl AmbientTransaction for MockTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn clone_handle(&self) -> Arc<dyn AmbientTransaction> {
        Arc::new(Self {
            id: self.id,
            shared: Arc::clone(&self.shared),
            disposed: AtomicBool::new(false),
        })
    }

    fn status(&self) -> Result<TransactionStatus, TransactionError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TransactionError::Disposed);
        }
        Ok(self.shared.status.lock().unwrap_or(TransactionStatus::Active))
    }

    fn on_completed(&self, callback: CompletionCallback) {
        let mut pending = self.shared.subscribers.lock();
        let completed = *self.shared.status.lock();
        match completed {
            Some(status) => {
                drop(pending);
                callback(self.id, status);
            }
            None => pending.push(callback),
        }
    }
}
