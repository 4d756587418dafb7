//! # mssql-testing
//!
//! Test infrastructure for the retry and pooling crates.
//!
//! This crate provides in-memory stand-ins for the collaborators the pool
//! drives, so lifecycle scenarios run without a server.
//!
//! ## Features
//!
//! - Mock physical connections with call counters and switchable flags
//! - Mock connector with scripted connect failures
//! - Mock ambient transactions with completion callbacks
//! - Fault and option fixtures
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_testing::{MockConnector, MockTransaction, fixtures};
//!
//! #[tokio::test]
//! async fn test_stasis() {
//!     let connector = MockConnector::new();
//!     let registry = fixtures::test_registry(connector.clone());
//!     let tx = MockTransaction::begin();
//!
//!     let conn = Connection::new(registry, fixtures::unpooled_options("db"));
//!     conn.open_with_transaction(Some(&tx.handle())).await?;
//!     connector.last().unwrap().set_transaction_root(true);
//!     conn.close()?;
//!
//!     tx.commit();
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock_connection;
pub mod mock_transaction;

pub use mock_connection::{MockConnection, MockConnector, MockConnectorBuilder, MockOutcome, MockState};
pub use mock_transaction::MockTransaction;

/// Install a `tracing` subscriber writing to the test harness, once per
/// process. Set `RUST_LOG` to choose the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
