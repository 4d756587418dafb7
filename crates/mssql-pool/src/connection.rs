//! Owner-facing connection handle.
//!
//! A [`Connection`] is what application code holds. It owns an [`Owner`]
//! identity and, while open, an [`InternalConnection`] checked out of the
//! registry.
//!
//! ## State Transitions
//!
//! ```text
//! Closed -> Connecting (open)
//! Connecting -> Open (registry handed out a connection)
//! Connecting -> Closed (open failed or was cancelled)
//! Open -> Closing -> Closed (close, or drop)
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PoolError;
use crate::internal::{InternalConnection, Owner};
use crate::lifecycle::{ConnectionState, PhysicalConnection};
use crate::options::ConnectionOptions;
use crate::references::Dependent;
use crate::registry::PoolGroupRegistry;
use crate::transaction::AmbientTransaction;

enum Inner {
    Closed,
    Connecting,
    Open(Arc<InternalConnection>),
    Closing,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        match self {
            Self::Closed => ConnectionState::Closed,
            Self::Connecting => ConnectionState::Connecting,
            Self::Open(_) => ConnectionState::Open,
            Self::Closing => ConnectionState::Closing,
        }
    }
}

/// A logical connection.
///
/// Dropping an open connection closes it.
///
/// # Example
///
/// ```rust,ignore
/// let registry = Arc::new(PoolGroupRegistry::new(connector));
/// let conn = Connection::new(Arc::clone(&registry), options);
///
/// conn.open().await?;
/// conn.with_physical(|physical| physical.is_alive())?;
/// conn.close()?;
/// ```
pub struct Connection {
    owner: Arc<Owner>,
    registry: Arc<PoolGroupRegistry>,
    options: Mutex<ConnectionOptions>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("owner", &self.owner.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a closed connection that will open through `registry`.
    #[must_use]
    pub fn new(registry: Arc<PoolGroupRegistry>, options: ConnectionOptions) -> Self {
        Self {
            owner: Owner::new(),
            registry,
            options: Mutex::new(options),
            inner: Mutex::new(Inner::Closed),
        }
    }

    /// This connection's owner identity.
    #[must_use]
    pub fn owner(&self) -> &Arc<Owner> {
        &self.owner
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state()
    }

    /// Check if the connection is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The options the next `open` will use.
    #[must_use]
    pub fn options(&self) -> ConnectionOptions {
        self.options.lock().clone()
    }

    /// Replace the options. Only allowed while closed.
    pub fn set_options(&self, options: ConnectionOptions) -> Result<(), PoolError> {
        let inner = self.inner.lock();
        let state = inner.state();
        if !state.is_closed() {
            return Err(PoolError::ConnectionBusy(state.as_str()));
        }
        *self.options.lock() = options;
        Ok(())
    }

    /// Open the connection.
    pub async fn open(&self) -> Result<(), PoolError> {
        self.open_with_transaction(None).await
    }

    /// Open the connection inside an ambient transaction.
    ///
    /// A connection parked for the same transaction is preferred.
    pub async fn open_with_transaction(
        &self,
        transaction: Option<&Arc<dyn AmbientTransaction>>,
    ) -> Result<(), PoolError> {
        {
            let mut inner = self.inner.lock();
            let state = inner.state();
            if !state.is_closed() {
                return Err(PoolError::ConnectionBusy(state.as_str()));
            }
            *inner = Inner::Connecting;
        }
        let connecting = ConnectingGuard(self);

        let options = self.options();
        let internal = self.registry.open(&options, &self.owner, transaction).await?;
        tracing::debug!(
            owner = self.owner.id(),
            connection_id = internal.id(),
            "connection opened"
        );
        *self.inner.lock() = Inner::Open(internal);
        drop(connecting);
        Ok(())
    }

    /// Close the connection, releasing the internal connection to its pool.
    ///
    /// Closing a connection that is not open does nothing.
    pub fn close(&self) -> Result<(), PoolError> {
        let internal = {
            let mut inner = self.inner.lock();
            match std::mem::replace(&mut *inner, Inner::Closing) {
                Inner::Open(internal) => internal,
                other => {
                    *inner = other;
                    return Ok(());
                }
            }
        };
        let _closed = ClosedGuard(self);

        tracing::debug!(
            owner = self.owner.id(),
            connection_id = internal.id(),
            "closing connection"
        );
        internal.close_connection(&self.owner)
    }

    /// Join `transaction`, or leave the current one with `None`.
    pub fn enlist_transaction(
        &self,
        transaction: Option<&Arc<dyn AmbientTransaction>>,
    ) -> Result<(), PoolError> {
        self.internal()?.enlist_transaction(transaction)
    }

    /// Track a dependent that must hear when this connection is released.
    pub fn track_dependent<T: Dependent>(&self, dependent: &Arc<T>, tag: i32) -> Result<(), PoolError> {
        self.internal()?.add_dependent(dependent, tag);
        Ok(())
    }

    /// Stop tracking a dependent. Does nothing when closed.
    pub fn untrack_dependent<T: Dependent + ?Sized>(&self, dependent: &Arc<T>) {
        if let Ok(internal) = self.internal() {
            internal.remove_dependent(dependent);
        }
    }

    /// Find a tracked dependent by tag and predicate.
    pub fn find_dependent<F>(&self, tag: i32, predicate: F) -> Option<Arc<dyn Dependent>>
    where
        F: Fn(&dyn Dependent) -> bool,
    {
        self.internal().ok()?.find_dependent(tag, predicate)
    }

    /// Run `f` against the physical connection.
    pub fn with_physical<R>(&self, f: impl FnOnce(&dyn PhysicalConnection) -> R) -> Result<R, PoolError> {
        let internal = self.internal()?;
        Ok(f(internal.physical()))
    }

    /// The internal connection currently attached.
    pub fn internal(&self) -> Result<Arc<InternalConnection>, PoolError> {
        match &*self.inner.lock() {
            Inner::Open(internal) => Ok(Arc::clone(internal)),
            _ => Err(PoolError::ConnectionClosed),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            tracing::error!(owner = self.owner.id(), %error, "failed to close connection on drop");
        }
    }
}

/// Resets `Connecting` to `Closed` if open did not finish.
struct ConnectingGuard<'a>(&'a Connection);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.0.inner.lock();
        if matches!(*inner, Inner::Connecting) {
            *inner = Inner::Closed;
        }
    }
}

/// Leaves the connection `Closed` however the release went.
struct ClosedGuard<'a>(&'a Connection);

impl Drop for ClosedGuard<'_> {
    fn drop(&mut self) {
        *self.0.inner.lock() = Inner::Closed;
    }
}
