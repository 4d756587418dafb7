//! Connections parked for an ambient transaction.
//!
//! A pooled connection released while still enlisted cannot serve other
//! transactions. It waits here, keyed by transaction, until either the same
//! transaction asks for a connection again or the transaction completes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::internal::InternalConnection;
use crate::transaction::{AmbientTransaction, TransactionId};

struct TransactedList {
    // Keeps the transaction alive while connections wait on it.
    _transaction: Arc<dyn AmbientTransaction>,
    connections: Vec<Arc<InternalConnection>>,
}

/// Map from transaction to the connections parked for it.
#[derive(Default)]
pub struct TransactedPool {
    lists: Mutex<HashMap<TransactionId, TransactedList>>,
}

impl std::fmt::Debug for TransactedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactedPool")
            .field("transactions", &self.lists.lock().len())
            .finish()
    }
}

impl TransactedPool {
    /// Create an empty transacted pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the most recently parked connection for `transaction`.
    pub fn get(&self, transaction: TransactionId) -> Option<Arc<InternalConnection>> {
        let connection = self
            .lists
            .lock()
            .get_mut(&transaction)
            .and_then(|list| list.connections.pop());
        if let Some(connection) = &connection {
            tracing::trace!(
                connection_id = connection.id(),
                %transaction,
                "popped from transacted pool"
            );
        }
        connection
    }

    /// Park `connection` for `transaction`. Parking the same connection
    /// twice has no effect.
    pub fn put(&self, transaction: &Arc<dyn AmbientTransaction>, connection: Arc<InternalConnection>) {
        let id = transaction.id();
        let mut lists = self.lists.lock();
        let list = lists.entry(id).or_insert_with(|| TransactedList {
            _transaction: transaction.clone_handle(),
            connections: Vec::with_capacity(2),
        });
        if list.connections.iter().any(|c| Arc::ptr_eq(c, &connection)) {
            return;
        }
        tracing::trace!(connection_id = connection.id(), transaction = %id, "parked in transacted pool");
        list.connections.push(connection);
    }

    /// Remove `connection` from the list for `transaction`, dropping the list
    /// once it is empty.
    ///
    /// Returns `true` if the connection was parked here.
    pub fn transaction_ended(&self, transaction: TransactionId, connection: &Arc<InternalConnection>) -> bool {
        let mut lists = self.lists.lock();
        let Some(list) = lists.get_mut(&transaction) else {
            return false;
        };
        let position = list.connections.iter().position(|c| Arc::ptr_eq(c, connection));
        if let Some(index) = position {
            list.connections.remove(index);
        }
        if list.connections.is_empty() {
            lists.remove(&transaction);
        }
        position.is_some()
    }

    /// Total parked connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lists.lock().values().map(|l| l.connections.len()).sum()
    }

    /// Check if nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of transactions with parked connections.
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.lists.lock().len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::lifecycle::PhysicalConnection;
    use crate::metrics::PoolMetrics;
    use crate::transaction::{CompletionCallback, TransactionError, TransactionStatus};
    use mssql_retry::Fault;
    use std::any::Any;

    struct Noop;

    impl PhysicalConnection for Noop {
        fn activate(&self, _: Option<&Arc<dyn AmbientTransaction>>) -> Result<(), Fault> {
            Ok(())
        }
        fn deactivate(&self) {}
        fn dispose(&self) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct Tx(u64);

    impl AmbientTransaction for Tx {
        fn id(&self) -> TransactionId {
            TransactionId(self.0)
        }
        fn clone_handle(&self) -> Arc<dyn AmbientTransaction> {
            Arc::new(Tx(self.0))
        }
        fn status(&self) -> Result<TransactionStatus, TransactionError> {
            Ok(TransactionStatus::Active)
        }
        fn on_completed(&self, _: CompletionCallback) {}
    }

    fn connection() -> Arc<InternalConnection> {
        InternalConnection::new(Box::new(Noop), Arc::new(PoolMetrics::new()))
    }

    #[test]
    fn test_put_is_idempotent_and_get_is_lifo() {
        let pool = TransactedPool::new();
        let tx: Arc<dyn AmbientTransaction> = Arc::new(Tx(1));
        let a = connection();
        let b = connection();

        pool.put(&tx, Arc::clone(&a));
        pool.put(&tx, Arc::clone(&a));
        pool.put(&tx, Arc::clone(&b));
        assert_eq!(pool.len(), 2);

        assert!(Arc::ptr_eq(&pool.get(tx.id()).unwrap(), &b));
        assert!(Arc::ptr_eq(&pool.get(tx.id()).unwrap(), &a));
        assert!(pool.get(tx.id()).is_none());
        assert!(pool.get(TransactionId(99)).is_none());
    }

    #[test]
    fn test_transaction_ended_drops_empty_list() {
        let pool = TransactedPool::new();
        let tx: Arc<dyn AmbientTransaction> = Arc::new(Tx(1));
        let a = connection();
        let stray = connection();
        pool.put(&tx, Arc::clone(&a));

        assert!(!pool.transaction_ended(tx.id(), &stray));
        assert_eq!(pool.transaction_count(), 1);

        assert!(pool.transaction_ended(tx.id(), &a));
        assert_eq!(pool.transaction_count(), 0);
        assert!(!pool.transaction_ended(tx.id(), &a));
    }
}
