/// Unified error handling for the replica router
///
/// Errors are split in two layers: `QueryError` describes what went wrong on a
/// single replica connection, `RouterError` is what callers of the router see.
/// The API layer is expected to match on the router error kind to decide
/// between retrying on the primary and surfacing a degraded response.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::core::ReplicaId;

/// Main error type for router operations
#[derive(Debug, Error)]
pub enum RouterError {
    /// Replica connection could not be opened; the replica was not registered
    #[error("Failed to register replica '{name}': {source}")]
    Registration {
        name: String,
        #[source]
        source: QueryError,
    },

    /// Replica configuration rejected before any connection attempt
    #[error("Invalid replica configuration: {message}")]
    InvalidReplicaConfig { message: String },

    /// Routing rule rejected (bad pattern, unknown replica)
    #[error("Invalid routing rule: {message}")]
    InvalidRule { message: String },

    /// No candidate survived the selection policy
    #[error("No healthy replica available")]
    NoHealthyReplica,

    /// Selected replica went unhealthy between selection and execution
    #[error("Replica {replica_id} is unavailable")]
    ReplicaUnavailable { replica_id: ReplicaId },

    /// All attempts on the chosen replica failed
    #[error("Query failed on replica {replica_id} after {attempts} attempt(s): {source}")]
    Execution {
        replica_id: ReplicaId,
        attempts: u32,
        #[source]
        source: QueryError,
    },

    /// Referenced replica is not registered
    #[error("Unknown replica: {replica_id}")]
    UnknownReplica { replica_id: ReplicaId },

    /// Caller abandoned the query
    #[error("Query cancelled by caller")]
    Cancelled,

    /// Router has been shut down
    #[error("Replica router has been shut down")]
    ManagerShutdown,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Failure of a single operation on a replica connection
#[derive(Debug, Error)]
pub enum QueryError {
    /// SQLite driver error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Operation exceeded the replica's configured timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Connection was closed before or during the operation
    #[error("Connection closed")]
    Closed,

    /// Backend reported a failure that has no more specific kind
    #[error("Backend error: {0}")]
    Backend(String),

    /// Blocking worker task panicked or was cancelled
    #[error("Worker task failed: {0}")]
    TaskJoin(String),
}

/// Result type alias for router operations
pub type RouterResult<T> = Result<T, RouterError>;

impl RouterError {
    /// Create a replica configuration error
    pub fn invalid_replica<S: Into<String>>(message: S) -> Self {
        RouterError::InvalidReplicaConfig {
            message: message.into(),
        }
    }

    /// Create a routing rule error
    pub fn invalid_rule<S: Into<String>>(message: S) -> Self {
        RouterError::InvalidRule {
            message: message.into(),
        }
    }

    /// Whether the API layer may sensibly retry the read elsewhere (e.g. on the primary)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RouterError::NoHealthyReplica
                | RouterError::ReplicaUnavailable { .. }
                | RouterError::Execution { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RouterError::Config(_) => ErrorSeverity::Critical,
            RouterError::NoHealthyReplica => ErrorSeverity::Critical,
            RouterError::Registration { .. } => ErrorSeverity::Error,
            RouterError::Execution { .. } => ErrorSeverity::Error,
            RouterError::ReplicaUnavailable { .. } => ErrorSeverity::Warning,
            RouterError::ManagerShutdown => ErrorSeverity::Warning,
            RouterError::Cancelled => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

impl QueryError {
    /// Create a backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        QueryError::Backend(message.into())
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
