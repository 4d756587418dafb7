//! Fault types consumed and produced by retry execution.

use std::fmt;

use thiserror::Error;

/// A single error reported by SQL Server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Error number.
    pub number: i32,
    /// Error class/severity (0-25).
    pub class: u8,
    /// Error state.
    pub state: u8,
    /// Error message.
    pub message: String,
}

impl ServerError {
    /// Create a server error with the given number and message.
    pub fn new(number: i32, message: impl Into<String>) -> Self {
        Self {
            number,
            class: 16,
            state: 1,
            message: message.into(),
        }
    }

    /// Set the error class.
    #[must_use]
    pub fn with_class(mut self, class: u8) -> Self {
        self.class = class;
        self
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (class {}): {}", self.number, self.class, self.message)
    }
}

/// A fault that the retry machinery knows how to classify.
///
/// Transient classification only looks at the server error collection, so
/// network-level faults with no server errors are never transient unless a
/// custom classifier says otherwise.
pub trait RetryableFault: std::error::Error + Send + Sync + 'static {
    /// Server errors carried by this fault, in the order the server sent them.
    fn server_errors(&self) -> &[ServerError];

    /// Whether the server asked the client not to reconnect.
    fn reconnect_forbidden(&self) -> bool {
        false
    }
}

/// Faults reported by the collaborators this crate wraps.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Fault {
    /// Server returned one or more errors.
    #[error("server error {}", describe_errors(.errors))]
    Server {
        /// The error collection, first error first.
        errors: Vec<ServerError>,
        /// Server signalled that reconnecting will not help.
        reconnect_forbidden: bool,
    },

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connection timeout occurred.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other collaborator failure.
    #[error("{0}")]
    Other(String),
}

fn describe_errors(errors: &[ServerError]) -> String {
    match errors {
        [] => "with no details".to_string(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{first} (+{} more)", rest.len()),
    }
}

impl Fault {
    /// Create a server fault carrying a single error number.
    pub fn server(number: i32, message: impl Into<String>) -> Self {
        Self::Server {
            errors: vec![ServerError::new(number, message)],
            reconnect_forbidden: false,
        }
    }

    /// Check if this is a server error with a specific number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        self.server_errors().iter().any(|e| e.number == number)
    }
}

impl RetryableFault for Fault {
    fn server_errors(&self) -> &[ServerError] {
        match self {
            Self::Server { errors, .. } => errors,
            _ => &[],
        }
    }

    fn reconnect_forbidden(&self) -> bool {
        matches!(
            self,
            Self::Server {
                reconnect_forbidden: true,
                ..
            }
        )
    }
}

/// Outcome of a retried operation that did not succeed.
///
/// Intermediate faults are never discarded: [`RetryError::Exhausted`] and
/// [`RetryError::Cancelled`] carry every fault in attempt order.
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// The fault was not retried (non-transient or ineligible operation).
    #[error(transparent)]
    Fault(E),

    /// Every allowed attempt failed with a transient fault.
    #[error("retry limit exceeded after {} attempts", .faults.len())]
    Exhausted {
        /// Faults in attempt order.
        faults: Vec<E>,
    },

    /// The wait before the next attempt was cancelled.
    #[error("retry cancelled after {} attempts", .faults.len())]
    Cancelled {
        /// Faults in attempt order.
        faults: Vec<E>,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// All faults observed, in attempt order.
    #[must_use]
    pub fn faults(&self) -> &[E] {
        match self {
            Self::Fault(fault) => std::slice::from_ref(fault),
            Self::Exhausted { faults } | Self::Cancelled { faults } => faults,
        }
    }

    /// The most recent fault.
    #[must_use]
    pub fn last_fault(&self) -> Option<&E> {
        self.faults().last()
    }

    /// Check if retrying was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Check if every allowed attempt was used up.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// Consume the error and return the faults in attempt order.
    #[must_use]
    pub fn into_faults(self) -> Vec<E> {
        match self {
            Self::Fault(fault) => vec![fault],
            Self::Exhausted { faults } | Self::Cancelled { faults } => faults,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_server_fault_display() {
        let fault = Fault::server(1205, "deadlock victim");
        assert!(fault.to_string().contains("1205"));
        assert!(fault.to_string().contains("deadlock victim"));
        assert!(fault.is_server_error(1205));
        assert!(!fault.is_server_error(4060));
    }

    #[test]
    fn test_multiple_server_errors_display() {
        let fault = Fault::Server {
            errors: vec![ServerError::new(40613, "a"), ServerError::new(4060, "b")],
            reconnect_forbidden: false,
        };
        assert!(fault.to_string().contains("+1 more"));
        assert_eq!(fault.server_errors().len(), 2);
    }

    #[test]
    fn test_non_server_faults_have_no_errors() {
        assert!(Fault::ConnectionClosed.server_errors().is_empty());
        assert!(!Fault::ConnectionTimeout.reconnect_forbidden());
    }

    #[test]
    fn test_retry_error_faults_in_order() {
        let err = RetryError::Exhausted {
            faults: vec![Fault::server(1, "a"), Fault::server(2, "b")],
        };
        assert!(err.is_exhausted());
        assert!(err.last_fault().unwrap().is_server_error(2));
        assert!(err.to_string().contains("2 attempts"));

        let numbers: Vec<i32> = err
            .into_faults()
            .iter()
            .map(|f| f.server_errors()[0].number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn test_retry_error_fault_is_transparent() {
        let err = RetryError::Fault(Fault::ConnectionClosed);
        assert_eq!(err.to_string(), "connection closed");
        assert_eq!(err.faults().len(), 1);
        assert!(!err.is_cancelled());
    }
}
