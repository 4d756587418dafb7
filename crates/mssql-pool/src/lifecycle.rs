//! Seams between the pool and the wire-protocol layer.
//!
//! The pool never speaks TDS itself. It drives a [`PhysicalConnection`]
//! through activation and deactivation and asks a [`Connector`] for new
//! ones.

use std::any::Any;
use std::sync::Arc;

use mssql_retry::Fault;

use crate::options::ConnectionOptions;
use crate::transaction::AmbientTransaction;

/// A physical server connection as seen by the pool.
///
/// All methods take `&self`; implementations keep their own interior
/// state. They are called with the owning connection's lifecycle lock held,
/// so they must not call back into the pool.
pub trait PhysicalConnection: Send + Sync + 'static {
    /// Prepare the connection for a new owner, joining `transaction` if any.
    fn activate(&self, transaction: Option<&Arc<dyn AmbientTransaction>>) -> Result<(), Fault>;

    /// Drain in-flight work after the owner is done.
    fn deactivate(&self);

    /// Tear the connection down.
    fn dispose(&self);

    /// Cheap liveness probe used on checkout.
    fn is_alive(&self) -> bool {
        true
    }

    /// Whether this connection holds commit responsibility for a delegated
    /// transaction.
    fn is_transaction_root(&self) -> bool {
        false
    }

    /// Whether this connection is a transaction root that may not be pooled
    /// while the transaction runs.
    fn is_non_poolable_transaction_root(&self) -> bool {
        false
    }

    /// Whether the connection drops its transaction binding as soon as the
    /// transaction completes, even while owned.
    fn unbind_on_transaction_completion(&self) -> bool {
        true
    }

    /// Join or leave an ambient transaction on the server.
    fn enlist(&self, transaction: Option<&Arc<dyn AmbientTransaction>>) -> Result<(), Fault> {
        let _ = transaction;
        Ok(())
    }

    /// Access the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Factory for physical connections.
///
/// `#[async_trait]` keeps the trait object-safe so pools can hold
/// `Arc<dyn Connector>`.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new physical connection.
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn PhysicalConnection>, Fault>;
}

/// Coarse protocol-visible state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No internal connection is attached.
    Closed,
    /// An internal connection is being obtained.
    Connecting,
    /// Attached to an internal connection.
    Open,
    /// The internal connection is being released.
    Closing,
}

impl ConnectionState {
    /// Check if options may be changed in this state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Check if the connection is in a transition.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Connecting | Self::Closing)
    }

    /// Lowercase name for diagnostics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    impl PhysicalConnection for Bare {
        fn activate(&self, _: Option<&Arc<dyn AmbientTransaction>>) -> Result<(), Fault> {
            Ok(())
        }

        fn deactivate(&self) {}

        fn dispose(&self) {}

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_physical_defaults() {
        let conn = Bare;
        assert!(conn.is_alive());
        assert!(!conn.is_transaction_root());
        assert!(!conn.is_non_poolable_transaction_root());
        assert!(conn.unbind_on_transaction_completion());
        assert!(conn.enlist(None).is_ok());
        assert!(conn.as_any().downcast_ref::<Bare>().is_some());
    }

    #[test]
    fn test_connection_state_closed() {
        assert!(ConnectionState::Closed.is_closed());
        assert!(!ConnectionState::Open.is_closed());
        assert!(!ConnectionState::Closing.is_closed());
    }

    #[test]
    fn test_connection_state_busy() {
        assert!(!ConnectionState::Closed.is_busy());
        assert!(!ConnectionState::Open.is_busy());
        assert!(ConnectionState::Connecting.is_busy());
        assert!(ConnectionState::Closing.is_busy());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
