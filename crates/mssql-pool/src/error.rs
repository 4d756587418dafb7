//! Pool error types.

use mssql_retry::{Fault, RetryError};
use thiserror::Error;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Failed to acquire a connection within the timeout.
    #[error("connection acquisition timeout after {0:?}")]
    AcquisitionTimeout(std::time::Duration),

    /// Pool is shutting down and hands out no more connections.
    #[error("pool is shutting down")]
    PoolShuttingDown,

    /// Connection creation failed, possibly after retries.
    #[error("failed to create connection: {0}")]
    ConnectionCreation(#[source] RetryError<Fault>),

    /// The physical connection refused activation.
    #[error("failed to activate connection: {0}")]
    Activation(#[source] Fault),

    /// Operation requires an open connection.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Operation requires a closed connection.
    #[error("connection is {0}; operation requires a closed connection")]
    ConnectionBusy(&'static str),

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),

    /// Pool bookkeeping found itself in an impossible state.
    #[error("internal pool error: {0}")]
    Internal(#[from] InternalError),
}

impl PoolError {
    /// Check if this error indicates a bug in the pool rather than an
    /// operational failure.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

/// Structural violations of the pooling protocol.
///
/// These are never retried and never swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum InternalError {
    /// Connection popped from a pool still has a live owner.
    #[error("pooled object has an owner")]
    PooledObjectHasOwner,

    /// Connection popped from a pool was counted more than once.
    #[error("pooled object is in the pool more than once")]
    PooledObjectInPoolMoreThanOnce,

    /// Non-pooled connection handed to a second owner.
    #[error("non-pooled object used more than once")]
    NonPooledObjectUsedMoreThanOnce,

    /// Connection pushed while already counted as pooled.
    #[error("pushing object a second time")]
    PushingObjectSecondTime,

    /// Ownerless push found a live owner.
    #[error("unpooled object has an owner")]
    UnpooledObjectHasOwner,

    /// Push named a different owner than the current one.
    #[error("unpooled object has the wrong owner")]
    UnpooledObjectHasWrongOwner,

    /// Activated without an intervening deactivation.
    #[error("connection activated twice")]
    ActivatedTwice,

    /// Pooled connection lost its pool.
    #[error("pooled object has no pool")]
    PooledObjectWithoutPool,

    /// Pool group disabled faster than a pool could be obtained from it.
    #[error("pool group disabled while opening")]
    PoolGroupDisabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_errors_are_flagged() {
        let err: PoolError = InternalError::ActivatedTwice.into();
        assert!(err.is_internal());
        assert_eq!(err.to_string(), "internal pool error: connection activated twice");
        assert!(!PoolError::ConnectionClosed.is_internal());
    }

    #[test]
    fn test_creation_error_display() {
        let err = PoolError::ConnectionCreation(RetryError::Exhausted {
            faults: vec![Fault::server(40613, "database unavailable")],
        });
        assert!(err.to_string().contains("retry limit exceeded after 1 attempts"));
    }
}
