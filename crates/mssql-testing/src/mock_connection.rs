//! Mock physical connections and connector.
//!
//! [`MockConnector`] hands out [`MockConnection`]s and keeps a handle to the
//! state of each one, so a test can flip liveness or transaction-root flags
//! after the pool has taken ownership of the connection.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_testing::mock_connection::{MockConnector, MockOutcome};
//!
//! let connector = MockConnector::builder()
//!     .with_outcome(MockOutcome::Fail(40613))
//!     .build();
//!
//! let registry = PoolGroupRegistry::new(connector.clone());
//! // First connect fails with a transient error, the retry succeeds.
//! ```

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use mssql_driver_pool::{AmbientTransaction, ConnectionOptions, Connector, PhysicalConnection};
use mssql_retry::Fault;
use parking_lot::Mutex;

/// Shared, inspectable state of one mock connection.
#[derive(Debug, Default)]
pub struct MockState {
    id: u32,
    activations: AtomicU32,
    deactivations: AtomicU32,
    disposals: AtomicU32,
    enlistments: AtomicU32,
    dead: AtomicBool,
    transaction_root: AtomicBool,
    non_poolable_root: AtomicBool,
    keep_binding: AtomicBool,
    fail_activation: Mutex<Option<i32>>,
}

impl MockState {
    /// Order in which the connector created this connection, from 1.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of `activate` calls.
    #[must_use]
    pub fn activations(&self) -> u32 {
        self.activations.load(Ordering::SeqCst)
    }

    /// Number of `deactivate` calls.
    #[must_use]
    pub fn deactivations(&self) -> u32 {
        self.deactivations.load(Ordering::SeqCst)
    }

    /// Number of `dispose` calls.
    #[must_use]
    pub fn disposals(&self) -> u32 {
        self.disposals.load(Ordering::SeqCst)
    }

    /// Number of `enlist` calls.
    #[must_use]
    pub fn enlistments(&self) -> u32 {
        self.enlistments.load(Ordering::SeqCst)
    }

    /// Check if `dispose` ran.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposals() > 0
    }

    /// Make liveness probes fail or succeed.
    pub fn set_alive(&self, alive: bool) {
        self.dead.store(!alive, Ordering::SeqCst);
    }

    /// Report holding commit responsibility for a delegated transaction.
    pub fn set_transaction_root(&self, root: bool) {
        self.transaction_root.store(root, Ordering::SeqCst);
    }

    /// Report being a transaction root that may not be pooled.
    pub fn set_non_poolable_root(&self, root: bool) {
        self.non_poolable_root.store(root, Ordering::SeqCst);
    }

    /// Keep the transaction binding after completion while owned.
    pub fn set_keep_binding(&self, keep: bool) {
        self.keep_binding.store(keep, Ordering::SeqCst);
    }

    /// Fail the next activation with a server error `number`.
    pub fn fail_next_activation(&self, number: i32) {
        *self.fail_activation.lock() = Some(number);
    }
}

/// A physical connection that only counts calls.
pub struct MockConnection {
    state: Arc<MockState>,
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.state.id)
            .finish_non_exhaustive()
    }
}

impl MockConnection {
    /// Create a standalone mock connection.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state(Arc::new(MockState::default()))
    }

    fn with_state(state: Arc<MockState>) -> Self {
        Self { state }
    }

    /// The connection's shared state.
    #[must_use]
    pub fn state(&self) -> &Arc<MockState> {
        &self.state
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalConnection for MockConnection {
    fn activate(&self, _transaction: Option<&Arc<dyn AmbientTransaction>>) -> Result<(), Fault> {
        self.state.activations.fetch_add(1, Ordering::SeqCst);
        match self.state.fail_activation.lock().take() {
            Some(number) => Err(Fault::server(number, "activation refused")),
            None => Ok(()),
        }
    }

    fn deactivate(&self) {
        self.state.deactivations.fetch_add(1, Ordering::SeqCst);
    }

    fn dispose(&self) {
        self.state.disposals.fetch_add(1, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        !self.state.dead.load(Ordering::SeqCst)
    }

    fn is_transaction_root(&self) -> bool {
        self.state.transaction_root.load(Ordering::SeqCst)
    }

    fn is_non_poolable_transaction_root(&self) -> bool {
        self.state.non_poolable_root.load(Ordering::SeqCst)
    }

    fn unbind_on_transaction_completion(&self) -> bool {
        !self.state.keep_binding.load(Ordering::SeqCst)
    }

    fn enlist(&self, _transaction: Option<&Arc<dyn AmbientTransaction>>) -> Result<(), Fault> {
        self.state.enlistments.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Scripted result of one connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    /// Connect successfully.
    Connect,
    /// Fail with a server error of this number.
    Fail(i32),
    /// Fail with a closed transport.
    Closed,
}

/// Connector producing [`MockConnection`]s.
#[derive(Debug, Default)]
pub struct MockConnector {
    outcomes: Mutex<VecDeque<MockOutcome>>,
    attempts: AtomicU32,
    created: Mutex<Vec<Arc<MockState>>>,
}

impl MockConnector {
    /// Create a connector that always succeeds.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a connector builder.
    #[must_use]
    pub fn builder() -> MockConnectorBuilder {
        MockConnectorBuilder::default()
    }

    /// Queue the outcome of a future attempt. Once the queue is empty every
    /// attempt succeeds.
    pub fn push_outcome(&self, outcome: MockOutcome) {
        self.outcomes.lock().push_back(outcome);
    }

    /// Number of connect attempts, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// State of every connection created so far, oldest first.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<MockState>> {
        self.created.lock().clone()
    }

    /// State of the most recently created connection.
    #[must_use]
    pub fn last(&self) -> Option<Arc<MockState>> {
        self.created.lock().last().cloned()
    }

    /// Number of connections created.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    fn next_outcome(&self) -> MockOutcome {
        self.outcomes.lock().pop_front().unwrap_or(MockOutcome::Connect)
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn PhysicalConnection>, Fault> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.next_outcome() {
            MockOutcome::Connect => {
                let mut created = self.created.lock();
                let state = Arc::new(MockState {
                    id: created.len() as u32 + 1,
                    ..MockState::default()
                });
                created.push(Arc::clone(&state));
                tracing::trace!(attempt, key = %options.pool_key(), "mock connect");
                Ok(Box::new(MockConnection::with_state(state)))
            }
            MockOutcome::Fail(number) => {
                tracing::trace!(attempt, number, "mock connect failed");
                Err(Fault::server(number, "mock connect failure"))
            }
            MockOutcome::Closed => Err(Fault::ConnectionClosed),
        }
    }
}

/// Builder for [`MockConnector`].
#[derive(Debug, Default)]
pub struct MockConnectorBuilder {
    outcomes: VecDeque<MockOutcome>,
}

impl MockConnectorBuilder {
    /// Queue one scripted outcome.
    #[must_use]
    pub fn with_outcome(mut self, outcome: MockOutcome) -> Self {
        self.outcomes.push_back(outcome);
        self
    }

    /// Queue `count` failures with server error `number`.
    #[must_use]
    pub fn with_failures(mut self, count: usize, number: i32) -> Self {
        self.outcomes
            .extend(std::iter::repeat_n(MockOutcome::Fail(number), count));
        self
    }

    /// Build the connector.
    #[must_use]
    pub fn build(self) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            outcomes: Mutex::new(self.outcomes),
            ..MockConnector::default()
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_outcomes_then_success() {
        let connector = MockConnector::builder()
            .with_failures(2, 40613)
            .with_outcome(MockOutcome::Closed)
            .build();
        let options = ConnectionOptions::new();

        for _ in 0..3 {
            assert!(connector.connect(&options).await.is_err());
        }
        let conn = connector.connect(&options).await.unwrap();

        assert_eq!(connector.attempts(), 4);
        assert_eq!(connector.created(), 1);
        assert!(conn.is_alive());
    }

    #[test]
    fn test_state_flags_reach_connection() {
        let conn = MockConnection::new();
        let state = Arc::clone(conn.state());

        state.set_alive(false);
        state.set_transaction_root(true);
        state.set_keep_binding(true);
        state.fail_next_activation(1205);

        assert!(!conn.is_alive());
        assert!(conn.is_transaction_root());
        assert!(!conn.unbind_on_transaction_completion());
        assert!(conn.activate(None).is_err());
        assert!(conn.activate(None).is_ok());
        assert_eq!(state.activations(), 2);
    }
}
