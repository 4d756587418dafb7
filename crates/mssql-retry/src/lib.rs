//! # mssql-retry
//!
//! Configurable retry logic for SQL Server operations.
//!
//! Network operations against SQL Server fail transiently all the time:
//! deadlock victims, Azure reconfigurations, resource-governor throttling.
//! This crate decides whether such a fault is worth another attempt and how
//! long to wait before making it.
//!
//! ## Features
//!
//! - Fixed, incremental and exponential intervals with ±20% jitter
//! - Transient classification by server error number, with a configurable allow-list
//! - Statement eligibility through a regular expression over the SQL text
//! - Blocking and cancellable async execution sharing one policy object
//! - Registry of named policy factories resolved from configuration, with a
//!   no-retry fallback that never fails
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_retry::{PolicyResolver, RetryConfig, RetryContext};
//!
//! let config = RetryConfig::new("exponential")
//!     .number_of_tries(5)
//!     .delta_time(Duration::from_secs(1));
//! let policy = PolicyResolver::new().resolve(Some(&config));
//!
//! let rows = policy
//!     .execute(&RetryContext::for_statement(sql), || client.query(sql))
//!     .await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod defaults;
pub mod fault;
pub mod interval;
pub mod policy;
pub mod resolver;
pub mod transient;

pub use config::{ConfigError, RetryConfig, RetryOptions, RetrySections};
pub use defaults::{command_policy, connection_policy, install_defaults, reset_defaults};
pub use fault::{Fault, RetryError, RetryableFault, ServerError};
pub use interval::{IntervalGenerator, IntervalKind, IntervalPolicy};
pub use policy::{RetryContext, RetryPolicy, RetryingEvent, execute_with_retry};
pub use resolver::{PolicyResolver, ResolveError};
pub use transient::{KNOWN_TRANSIENT_ERRORS, TransientErrors};
pub use tokio_util::sync::CancellationToken;
