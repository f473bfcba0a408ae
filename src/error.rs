//! Error types

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for configuration, credential, connection and query failures
///
/// Callers of the connection manager only ever see `Config`,
/// `CredentialService`, `ConnectionRefresh` and `QueryExecution` (plus
/// `InvalidInput` from the request handler). The remaining variants are the
/// underlying causes carried inside those four.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Token issuance failed
    #[error("credential service error: {0}")]
    CredentialService(String),

    /// Opening a replacement connection failed
    #[error("connection refresh failed: {source}")]
    ConnectionRefresh {
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// A live connection rejected or failed a query
    #[error("query execution failed: {source}")]
    QueryExecution {
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// I/O error on the transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unexpected or malformed protocol message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server rejected the credentials
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Server returned an ErrorResponse for a statement
    #[error("sql error: {0}")]
    Sql(String),

    /// Server closed the connection
    #[error("connection closed")]
    ConnectionClosed,

    /// Connection is not idle
    #[error("connection busy: {0}")]
    ConnectionBusy(String),

    /// Invalid state machine transition
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Operation exceeded its time bound
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Request handler rejected its input
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Wrap a cause as a connection refresh failure
    pub fn refresh(cause: Error) -> Self {
        match cause {
            e @ Error::ConnectionRefresh { .. } => e,
            e => Error::ConnectionRefresh {
                source: Box::new(e),
            },
        }
    }

    /// Wrap a cause as a query execution failure
    pub fn query(cause: Error) -> Self {
        match cause {
            e @ Error::QueryExecution { .. } => e,
            e => Error::QueryExecution {
                source: Box::new(e),
            },
        }
    }

    /// Stable label for logs and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::CredentialService(_) => "credential_service",
            Error::ConnectionRefresh { .. } => "connection_refresh",
            Error::QueryExecution { .. } => "query_execution",
            Error::Io(_) => "io",
            Error::Protocol(_) => "protocol",
            Error::Authentication(_) => "authentication",
            Error::Sql(_) => "sql",
            Error::ConnectionClosed => "connection_closed",
            Error::ConnectionBusy(_) => "connection_busy",
            Error::InvalidState { .. } => "invalid_state",
            Error::Timeout(_) => "timeout",
            Error::Cancelled => "cancelled",
            Error::InvalidInput(_) => "invalid_input",
        }
    }

    /// Root cause, looking through the refresh/query wrappers
    pub fn cause(&self) -> &Error {
        match self {
            Error::ConnectionRefresh { source } | Error::QueryExecution { source } => {
                source.cause()
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_wraps_cause() {
        let err = Error::refresh(Error::ConnectionClosed);
        assert_eq!(err.category(), "connection_refresh");
        assert!(matches!(err.cause(), Error::ConnectionClosed));
        assert_eq!(
            err.to_string(),
            "connection refresh failed: connection closed"
        );
    }

    #[test]
    fn test_refresh_does_not_double_wrap() {
        let err = Error::refresh(Error::refresh(Error::Cancelled));
        match err {
            Error::ConnectionRefresh { source } => assert!(matches!(*source, Error::Cancelled)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_query_wraps_sql_error() {
        let err = Error::query(Error::Sql("relation \"public.nope\" does not exist".into()));
        assert_eq!(err.category(), "query_execution");
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: Error = io_err.into();
        assert_eq!(err.category(), "io");
    }
}
