//! Ambient distributed transactions.
//!
//! The transaction coordinator is an external collaborator. The pool only
//! needs to identify a transaction, keep its own handle to it, ask whether it
//! is still running and hear about its completion.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Identity of an ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// Outcome reported by an ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Still running.
    Active,
    /// Committed.
    Committed,
    /// Rolled back.
    Aborted,
    /// Outcome unknown.
    InDoubt,
}

/// Errors raised when querying a transaction.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum TransactionError {
    /// The transaction object was disposed by its scope.
    #[error("transaction has been disposed")]
    Disposed,
}

/// Callback invoked once when a transaction completes.
pub type CompletionCallback = Box<dyn FnOnce(TransactionId, TransactionStatus) + Send>;

/// Handle to an ambient distributed transaction.
pub trait AmbientTransaction: Send + Sync + fmt::Debug {
    /// The transaction's identity.
    fn id(&self) -> TransactionId;

    /// Produce an independent handle that outlives the caller's scope.
    fn clone_handle(&self) -> Arc<dyn AmbientTransaction>;

    /// Current status; fails once the handle has been disposed.
    fn status(&self) -> Result<TransactionStatus, TransactionError>;

    /// Subscribe to completion. The callback runs at most once.
    fn on_completed(&self, callback: CompletionCallback);
}

/// Check if a transaction is still running. A disposed transaction is dead.
pub fn is_active(transaction: &dyn AmbientTransaction) -> bool {
    matches!(transaction.status(), Ok(TransactionStatus::Active))
}
