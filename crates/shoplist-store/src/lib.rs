//! Shopping-list item store
//!
//! Provisions a scope/collection/index topology on a document database,
//! turns list requests into paired fetch and count statements, and runs the
//! item lifecycle (upsert, fetch, buy/restore/toggle, delete) behind
//! filter-bound [`ItemStore`] handles.

pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod item;
pub mod query;
pub mod seed;
pub mod statement;
pub mod store;

#[cfg(feature = "couchbase")]
pub mod couchbase;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use cluster::{connect, BackendError, Cluster, FieldUpdate, Keyspace, PingReport};
pub use config::{ConfigError, ConnectionConfig, StoreConfig};
pub use error::{ErrorKind, Result, StoreError};
pub use item::*;
pub use query::*;
pub use seed::seed_sample_items;
pub use store::ItemStore;

#[cfg(feature = "couchbase")]
pub use couchbase::CouchbaseCluster;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCluster;
