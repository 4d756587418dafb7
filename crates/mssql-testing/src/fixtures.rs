//! Test fixture utilities.

use std::sync::Arc;
use std::time::Duration;

use mssql_driver_pool::{ConnectionOptions, PoolGroupRegistry, RegistryConfig};
use mssql_retry::{Fault, IntervalPolicy, RetryPolicy, ServerError};

use crate::mock_connection::MockConnector;

/// Deadlock victim; in the built-in transient table.
pub const TRANSIENT_ERROR: i32 = 1205;

/// Invalid object name; never transient.
pub const PERMANENT_ERROR: i32 = 208;

/// A fault the built-in classifier retries.
#[must_use]
pub fn transient_fault() -> Fault {
    Fault::server(TRANSIENT_ERROR, "Transaction was deadlocked")
}

/// A fault the built-in classifier does not retry.
#[must_use]
pub fn permanent_fault() -> Fault {
    Fault::server(PERMANENT_ERROR, "Invalid object name")
}

/// A transient error number the server marked as not worth reconnecting
/// for.
#[must_use]
pub fn reconnect_forbidden_fault() -> Fault {
    Fault::Server {
        errors: vec![ServerError::new(TRANSIENT_ERROR, "Transaction was deadlocked")],
        reconnect_forbidden: true,
    }
}

/// Options for a pooled test server.
#[must_use]
pub fn pooled_options(server: &str) -> ConnectionOptions {
    ConnectionOptions::new()
        .with("Data Source", server)
        .with("Initial Catalog", "testdb")
}

/// Options for a test server with pooling off.
#[must_use]
pub fn unpooled_options(server: &str) -> ConnectionOptions {
    pooled_options(server).with("Pooling", "false")
}

/// A fixed-interval policy with `attempts` tries and no waiting to speak of.
#[must_use]
pub fn quick_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::new(attempts, IntervalPolicy::fixed(Duration::from_millis(1)))
}

/// Registry over `connector` that never retries and prunes on a short
/// schedule.
#[must_use]
pub fn test_registry(connector: Arc<MockConnector>) -> Arc<PoolGroupRegistry> {
    Arc::new(
        PoolGroupRegistry::new(connector)
            .with_retry_policy(RetryPolicy::none())
            .with_config(
                RegistryConfig::new()
                    .prune_due(Duration::from_secs(1))
                    .prune_period(Duration::from_secs(1)),
            ),
    )
}
