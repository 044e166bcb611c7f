//! Error types for shoplist-store

use thiserror::Error;

use crate::cluster::BackendError;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Coarse classification of a [`StoreError`], for callers that map errors
/// onto transport status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Provisioning,
    Query,
    InvalidQuery,
    Persistence,
    NotFound,
    Configuration,
    CountMissing,
    Unhealthy,
}

/// Errors from the item store.
///
/// Per-operation variants carry the name of the failing operation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Cluster unreachable or credentials rejected
    #[error("Connection error: {0}")]
    Connection(String),

    /// Topology bootstrap failed for a reason other than "already exists"
    #[error("Provisioning {resource} failed: {message}")]
    Provisioning { resource: String, message: String },

    /// Statement rejected or failed by the query engine
    #[error("{op}: query failed: {message}")]
    Query { op: &'static str, message: String },

    /// Request parameters cannot form a valid statement
    #[error("{op}: invalid query: {message}")]
    InvalidQuery { op: &'static str, message: String },

    /// Write or read-back failure
    #[error("{op}: persistence failed: {message}")]
    Persistence { op: &'static str, message: String },

    /// Key absent from the collection
    #[error("{op}: item not found: {key}")]
    NotFound { op: &'static str, key: String },

    /// Operation invoked on a handle lacking required setup
    #[error("{op}: configuration error: {message}")]
    Configuration { op: &'static str, message: String },

    /// Aggregate count produced no row
    #[error("{op}: count query returned no rows")]
    CountMissing { op: &'static str },

    /// Health check reached the cluster but a service is not OK
    #[error("{op}: cluster unhealthy: {report}")]
    Unhealthy { op: &'static str, report: String },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Connection(_) => ErrorKind::Connection,
            StoreError::Provisioning { .. } => ErrorKind::Provisioning,
            StoreError::Query { .. } => ErrorKind::Query,
            StoreError::InvalidQuery { .. } => ErrorKind::InvalidQuery,
            StoreError::Persistence { .. } => ErrorKind::Persistence,
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Configuration { .. } => ErrorKind::Configuration,
            StoreError::CountMissing { .. } => ErrorKind::CountMissing,
            StoreError::Unhealthy { .. } => ErrorKind::Unhealthy,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn provisioning(resource: impl Into<String>, err: BackendError) -> Self {
        StoreError::Provisioning {
            resource: resource.into(),
            message: err.to_string(),
        }
    }

    /// Map an engine error from a query call.
    pub(crate) fn query(op: &'static str, err: BackendError) -> Self {
        StoreError::Query {
            op,
            message: err.to_string(),
        }
    }

    /// Map an engine error from a key-value call on `key`.
    pub(crate) fn persistence(op: &'static str, key: &str, err: BackendError) -> Self {
        match err {
            BackendError::DocumentNotFound(_) => StoreError::NotFound {
                op,
                key: key.to_string(),
            },
            other => StoreError::Persistence {
                op,
                message: other.to_string(),
            },
        }
    }
}
