//! # mssql-driver-pool
//!
//! Connection lifecycle and pooling core for SQL Server.
//!
//! The wire protocol lives elsewhere; this crate drives physical
//! connections through a [`PhysicalConnection`] trait and creates them
//! through a [`Connector`], with creation wrapped in a
//! [`mssql_retry::RetryPolicy`].
//!
//! ## Features
//!
//! - Per-connection state machine with doom/undoom and unpoolable flags
//! - Transaction-bound connections parked until their transaction ends
//! - Weak tracking of dependents (readers, commands) notified on release
//! - Abandoned-connection reclamation when a pool is at capacity
//! - Pool groups keyed by option identity, pruned on a timer
//! - Load-balance lifetime for pooled connections
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_driver_pool::{Connection, ConnectionOptions, PoolGroupRegistry};
//!
//! let registry = Arc::new(PoolGroupRegistry::new(connector));
//! let _pruning = registry.start_pruning();
//!
//! let options = ConnectionOptions::new()
//!     .with("Data Source", "db.example.com")
//!     .with("Max Pool Size", "20");
//!
//! let conn = Connection::new(Arc::clone(&registry), options);
//! conn.open().await?;
//! // Use connection...
//! conn.close()?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod group;
pub mod internal;
pub mod lifecycle;
pub mod metrics;
pub mod options;
pub mod pool;
pub mod references;
pub mod registry;
pub mod transacted;
pub mod transaction;

pub use config::{PoolConfig, RegistryConfig};
pub use connection::Connection;
pub use error::{InternalError, PoolError};
pub use group::{GroupState, PoolGroup};
pub use internal::{InternalConnection, Owner};
pub use lifecycle::{ConnectionState, Connector, PhysicalConnection};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use options::{ConnectionOptions, PoolKey};
pub use pool::{Pool, PoolBuilder, PoolStatus};
pub use references::{Dependent, ReferenceTracker};
pub use registry::{PoolGroupRegistry, PruneTask};
pub use transacted::TransactedPool;
pub use transaction::{
    AmbientTransaction, CompletionCallback, TransactionError, TransactionId, TransactionStatus,
};
