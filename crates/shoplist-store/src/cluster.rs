//! Engine seam between the item store and the document database.
//!
//! A [`Cluster`] exposes the handful of primitives the store needs:
//! topology management, key-value access, partial mutation, statement
//! execution and a health check. Engines report "already exists" and
//! "document not found" as distinct [`BackendError`] variants so the store
//! can apply its own idempotency and not-found rules.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::ConnectionConfig;
use crate::error::StoreError;
use crate::statement::SelectStatement;

/// Fully qualified collection address: `bucket.scope.collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Keyspace {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
}

impl Keyspace {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

/// Targeted replacement of one top-level document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub path: String,
    pub value: Value,
}

impl FieldUpdate {
    pub fn new(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
        }
    }
}

/// Errors reported by an engine.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("operation timed out")]
    Timeout,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl BackendError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, BackendError::AlreadyExists(_))
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Storage(format!("serialization: {}", err))
    }
}

/// Service families a ping can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Kv,
    Query,
    Search,
    Mgmt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingState {
    Ok,
    Timeout,
    Error,
}

/// Result of pinging a single service endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointPing {
    pub remote: String,
    pub state: PingState,
    pub latency_us: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health report of the services backing a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingReport {
    pub id: String,
    pub services: BTreeMap<ServiceType, Vec<EndpointPing>>,
}

impl PingReport {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            services: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, service: ServiceType, endpoint: EndpointPing) {
        self.services.entry(service).or_default().push(endpoint);
    }

    /// Every reported endpoint answered OK and at least one was reported.
    pub fn is_healthy(&self) -> bool {
        !self.services.is_empty()
            && self
                .services
                .values()
                .flatten()
                .all(|e| e.state == PingState::Ok)
    }
}

/// The primitives every document database engine provides to the store.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Short engine label for diagnostics.
    fn engine(&self) -> &'static str;

    /// Wait until `bucket` accepts operations, or fail after `timeout`.
    async fn wait_until_ready(&self, bucket: &str, timeout: Duration) -> Result<(), BackendError>;

    async fn create_bucket(&self, bucket: &str, ram_quota_mb: u64) -> Result<(), BackendError>;

    async fn create_scope(&self, bucket: &str, scope: &str) -> Result<(), BackendError>;

    async fn create_collection(&self, keyspace: &Keyspace) -> Result<(), BackendError>;

    async fn create_primary_index(&self, keyspace: &Keyspace) -> Result<(), BackendError>;

    /// Create a named secondary index over `fields`.
    async fn create_index(
        &self,
        keyspace: &Keyspace,
        name: &str,
        fields: &[String],
    ) -> Result<(), BackendError>;

    /// Create the full-text index backing the search predicate.
    async fn create_search_index(
        &self,
        keyspace: &Keyspace,
        name: &str,
        fields: &[String],
    ) -> Result<(), BackendError>;

    /// Fetch the raw document body stored under `key`.
    async fn get(&self, keyspace: &Keyspace, key: &str) -> Result<Value, BackendError>;

    /// Insert or replace the document stored under `key`.
    async fn upsert(&self, keyspace: &Keyspace, key: &str, doc: &Value) -> Result<(), BackendError>;

    /// Replace individual fields of an existing document.
    async fn mutate_in(
        &self,
        keyspace: &Keyspace,
        key: &str,
        updates: &[FieldUpdate],
    ) -> Result<(), BackendError>;

    async fn remove(&self, keyspace: &Keyspace, key: &str) -> Result<(), BackendError>;

    /// Run a select statement. Row statements yield documents with their key
    /// joined in as `id`; count statements yield `{"total": n}`.
    async fn query(
        &self,
        keyspace: &Keyspace,
        statement: &SelectStatement,
    ) -> Result<Vec<Value>, BackendError>;

    async fn ping(&self, bucket: &str) -> Result<PingReport, BackendError>;
}

/// Engine selected by the connection string scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineTarget {
    /// Embedded engine, in memory.
    SqliteMemory,
    /// Embedded engine backed by a file.
    SqliteFile(String),
    /// Couchbase Server reached over its REST and query services.
    Couchbase(String),
}

impl EngineTarget {
    pub fn parse(connection_string: &str) -> Result<Self, StoreError> {
        let s = connection_string.trim();
        if s == "sqlite::memory:" || s == "sqlite://:memory:" {
            return Ok(EngineTarget::SqliteMemory);
        }
        if let Some(path) = s.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(StoreError::Connection("sqlite connection string has no path".into()));
            }
            return Ok(EngineTarget::SqliteFile(path.to_string()));
        }
        for scheme in ["couchbase://", "couchbases://", "http://", "https://"] {
            if s.starts_with(scheme) {
                return Ok(EngineTarget::Couchbase(s.to_string()));
            }
        }
        Err(StoreError::Connection(format!(
            "unsupported connection string: {:?}",
            s
        )))
    }
}

/// Connect to the engine named by `config.connection_string`.
pub async fn connect(config: &ConnectionConfig) -> Result<Arc<dyn Cluster>, StoreError> {
    match EngineTarget::parse(&config.connection_string)? {
        #[cfg(feature = "sqlite")]
        EngineTarget::SqliteMemory => {
            let cluster = crate::sqlite::SqliteCluster::open_in_memory()
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            Ok(Arc::new(cluster))
        }
        #[cfg(feature = "sqlite")]
        EngineTarget::SqliteFile(path) => {
            let cluster = crate::sqlite::SqliteCluster::open(std::path::Path::new(&path))
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            Ok(Arc::new(cluster))
        }
        #[cfg(feature = "couchbase")]
        EngineTarget::Couchbase(_) => {
            let cluster = crate::couchbase::CouchbaseCluster::connect(config)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            Ok(Arc::new(cluster))
        }
        #[allow(unreachable_patterns)]
        other => Err(StoreError::Connection(format!(
            "engine for {:?} is not compiled in",
            other
        ))),
    }
}
