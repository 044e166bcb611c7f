//! Idempotent provisioning of the storage topology.
//!
//! Every step treats "already exists" as success so that any number of
//! processes can bootstrap against the same cluster. Any other failure
//! aborts and surfaces as [`StoreError::Provisioning`] (or
//! [`StoreError::Connection`] when the bucket never becomes reachable).

use crate::cluster::{BackendError, Cluster, Keyspace};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};

/// Prefix of per-field secondary index names.
pub const INDEX_PREFIX: &str = "ix_";

/// Provision bucket, scope and, when configured, the collection with its
/// indexes. Returns the keyspace of the provisioned collection.
pub async fn provision(cluster: &dyn Cluster, config: &StoreConfig) -> Result<Option<Keyspace>> {
    let bucket = &config.connection.bucket;

    ensure_bucket(cluster, config).await?;

    ignore_exists(cluster.create_scope(bucket, &config.scope).await)
        .map_err(|e| StoreError::provisioning(format!("scope {}", config.scope), e))?;

    let Some(collection) = config.collection.as_deref() else {
        tracing::debug!("No collection configured for bucket {}, skipping", bucket);
        return Ok(None);
    };
    let keyspace = Keyspace::new(bucket.as_str(), config.scope.as_str(), collection);

    ignore_exists(cluster.create_collection(&keyspace).await)
        .map_err(|e| StoreError::provisioning(format!("collection {}", keyspace), e))?;

    ignore_exists(cluster.create_primary_index(&keyspace).await)
        .map_err(|e| StoreError::provisioning(format!("primary index on {}", keyspace), e))?;

    for field in &config.indexed_fields {
        let name = format!("{}{}", INDEX_PREFIX, field);
        ignore_exists(
            cluster
                .create_index(&keyspace, &name, std::slice::from_ref(field))
                .await,
        )
        .map_err(|e| StoreError::provisioning(format!("index {}", name), e))?;
    }

    if !config.search_fields.is_empty() {
        ignore_exists(
            cluster
                .create_search_index(&keyspace, &config.search_index, &config.search_fields)
                .await,
        )
        .map_err(|e| {
            StoreError::provisioning(format!("search index {}", config.search_index), e)
        })?;
    }

    tracing::info!(
        "Provisioned {} on {} engine ({} secondary indexes)",
        keyspace,
        cluster.engine(),
        config.indexed_fields.len()
    );
    Ok(Some(keyspace))
}

/// Wait for the bucket without creating anything.
///
/// A bucket that is missing or not ready is only logged, so that a health
/// check can still report on it. Returns the configured keyspace, assumed to
/// be provisioned already.
pub async fn attach(cluster: &dyn Cluster, config: &StoreConfig) -> Result<Option<Keyspace>> {
    let bucket = &config.connection.bucket;
    match cluster.wait_until_ready(bucket, config.ready_timeout()).await {
        Ok(()) => {}
        Err(e @ BackendError::Timeout) | Err(e @ BackendError::BucketNotFound(_)) => {
            tracing::warn!("Bucket {} not ready, attaching anyway: {}", bucket, e);
        }
        Err(e) => return Err(StoreError::Connection(format!("bucket {}: {}", bucket, e))),
    }
    Ok(config
        .collection
        .as_deref()
        .map(|collection| Keyspace::new(bucket.as_str(), config.scope.as_str(), collection)))
}

/// Wait for the bucket; create it when the wait runs out, then wait again.
async fn ensure_bucket(cluster: &dyn Cluster, config: &StoreConfig) -> Result<()> {
    let bucket = &config.connection.bucket;
    let timeout = config.ready_timeout();

    match cluster.wait_until_ready(bucket, timeout).await {
        Ok(()) => return Ok(()),
        Err(BackendError::Timeout) | Err(BackendError::BucketNotFound(_)) => {}
        Err(e) => return Err(StoreError::Connection(format!("bucket {}: {}", bucket, e))),
    }

    tracing::warn!(
        "Bucket {} not ready after {:?}, creating it with {} MB",
        bucket,
        timeout,
        config.connection.ram_quota_mb
    );
    ignore_exists(
        cluster
            .create_bucket(bucket, config.connection.ram_quota_mb)
            .await,
    )
    .map_err(|e| StoreError::provisioning(format!("bucket {}", bucket), e))?;

    cluster
        .wait_until_ready(bucket, timeout)
        .await
        .map_err(|e| StoreError::provisioning(format!("bucket {}", bucket), e))
}

fn ignore_exists(
    result: std::result::Result<(), BackendError>,
) -> std::result::Result<(), BackendError> {
    match result {
        Err(e) if e.is_already_exists() => {
            tracing::debug!("{}, continuing", e);
            Ok(())
        }
        other => other,
    }
}
