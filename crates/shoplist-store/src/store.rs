use std::sync::Arc;
use std::time::Duration;

use crate::bootstrap;
use crate::cluster::{self, BackendError, Cluster, FieldUpdate, Keyspace};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::executor;
use crate::item::{new_item_key, now_millis, Item, ItemWithId};
use crate::query::{BoughtFilter, PaginationQuery};
use crate::statement::build_statements;

struct Shared {
    cluster: Arc<dyn Cluster>,
    bucket: String,
    keyspace: Option<Keyspace>,
    query_timeout: Option<Duration>,
}

/// Handle to the provisioned item collection, bound to one [`BoughtFilter`].
///
/// Handles are cheap to clone. All views derived through [`ItemStore::view`]
/// share the same cluster connection and collection; the filter only scopes
/// reads (`get_item`, `get_items`). Writes are keyed by identity and ignore
/// the filter.
#[derive(Clone)]
pub struct ItemStore {
    shared: Arc<Shared>,
    filter: BoughtFilter,
}

impl std::fmt::Debug for ItemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemStore")
            .field("engine", &self.shared.cluster.engine())
            .field("bucket", &self.shared.bucket)
            .field("keyspace", &self.shared.keyspace)
            .field("filter", &self.filter)
            .finish()
    }
}

impl ItemStore {
    /// Provision the topology on `cluster` and return an unfiltered handle.
    ///
    /// Fails without returning a handle if bootstrap fails.
    pub async fn open(cluster: Arc<dyn Cluster>, config: &StoreConfig) -> Result<Self> {
        config.validate().map_err(|e| StoreError::Configuration {
            op: "open",
            message: e.to_string(),
        })?;
        let keyspace = bootstrap::provision(cluster.as_ref(), config).await?;
        Ok(Self::from_parts(cluster, config, keyspace))
    }

    /// Connect to the engine named in `config` and provision it.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let cluster = cluster::connect(&config.connection).await?;
        Self::open(cluster, config).await
    }

    /// Bind to `cluster` without creating any bucket, scope, collection or
    /// index.
    ///
    /// Item operations fail at the engine if the topology was never
    /// provisioned; [`ItemStore::ping`] reports on whatever is there.
    pub async fn attach(cluster: Arc<dyn Cluster>, config: &StoreConfig) -> Result<Self> {
        config.validate().map_err(|e| StoreError::Configuration {
            op: "attach",
            message: e.to_string(),
        })?;
        let keyspace = bootstrap::attach(cluster.as_ref(), config).await?;
        Ok(Self::from_parts(cluster, config, keyspace))
    }

    /// Connect to the engine named in `config` and [`attach`](Self::attach).
    pub async fn connect_existing(config: &StoreConfig) -> Result<Self> {
        let cluster = cluster::connect(&config.connection).await?;
        Self::attach(cluster, config).await
    }

    fn from_parts(
        cluster: Arc<dyn Cluster>,
        config: &StoreConfig,
        keyspace: Option<Keyspace>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cluster,
                bucket: config.connection.bucket.clone(),
                keyspace,
                query_timeout: config.query_timeout(),
            }),
            filter: BoughtFilter::Unfiltered,
        }
    }

    /// A handle over the same collection that only sees `filter`'s view.
    pub fn view(&self, filter: BoughtFilter) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            filter,
        }
    }

    pub fn filter(&self) -> BoughtFilter {
        self.filter
    }

    pub fn keyspace(&self) -> Option<&Keyspace> {
        self.shared.keyspace.as_ref()
    }

    fn collection(&self, op: &'static str) -> Result<&Keyspace> {
        self.shared
            .keyspace
            .as_ref()
            .ok_or_else(|| StoreError::Configuration {
                op,
                message: "no collection bound to this handle".to_string(),
            })
    }

    /// Insert or replace an item, returning the stored document.
    ///
    /// An empty `key` mints a new time-ordered key. `created` is kept when
    /// set, carried over from the stored document when the key exists, and
    /// stamped otherwise. `updated` always moves forward.
    pub async fn upsert_item(&self, key: &str, mut item: Item) -> Result<ItemWithId> {
        const OP: &str = "upsert_item";
        let keyspace = self.collection(OP)?;
        let cluster = &self.shared.cluster;

        let supplied = !key.trim().is_empty();
        let key = if supplied {
            key.to_string()
        } else {
            new_item_key()
        };

        let now = now_millis();
        let mut previous_updated = item.updated;
        if item.created == 0 && supplied {
            match cluster.get(keyspace, &key).await {
                Ok(doc) => {
                    let existing = decode_item(OP, doc)?;
                    item.created = existing.created;
                    previous_updated = previous_updated.max(existing.updated);
                }
                Err(BackendError::DocumentNotFound(_)) => {}
                Err(e) => return Err(StoreError::persistence(OP, &key, e)),
            }
        }
        if item.created == 0 {
            item.created = now;
        }
        item.updated = now.max(previous_updated + 1);

        let doc = serde_json::to_value(&item).map_err(|e| StoreError::Persistence {
            op: OP,
            message: format!("encode item: {}", e),
        })?;
        cluster
            .upsert(keyspace, &key, &doc)
            .await
            .map_err(|e| StoreError::persistence(OP, &key, e))?;
        tracing::info!("Item upserted: {}", key);

        // The write stands even if the read-back fails.
        let stored = cluster.get(keyspace, &key).await.map_err(|e| StoreError::Persistence {
            op: OP,
            message: format!("read back {}: {}", key, e),
        })?;
        Ok(ItemWithId::new(key, decode_item(OP, stored)?))
    }

    /// Fetch an item by key.
    ///
    /// Returns `Ok(None)` when the item exists but falls outside this
    /// handle's view, and [`StoreError::NotFound`] when the key is absent.
    pub async fn get_item(&self, key: &str) -> Result<Option<ItemWithId>> {
        const OP: &str = "get_item";
        let keyspace = self.collection(OP)?;
        let item = self.read(OP, keyspace, key).await?;
        if !self.filter.admits(item.bought) {
            tracing::debug!("Item {} is outside the {} view", key, self.filter);
            return Ok(None);
        }
        Ok(Some(ItemWithId::new(key, item)))
    }

    /// List one page of this handle's view together with the view's total.
    pub async fn get_items(&self, query: &PaginationQuery) -> Result<(Vec<ItemWithId>, u64)> {
        let keyspace = self.collection("get_items")?;
        let pair = build_statements(self.filter, query)?;
        tracing::debug!("Query ({} view): {:?}", self.filter, pair.fetch);
        executor::fetch_and_count(
            self.shared.cluster.as_ref(),
            keyspace,
            &pair,
            self.shared.query_timeout,
        )
        .await
    }

    /// Set `bought` explicitly, or toggle it when `bought` is `None`.
    ///
    /// Only the `bought` and `updated` fields are rewritten.
    pub async fn buy_item(&self, key: &str, bought: Option<bool>) -> Result<()> {
        const OP: &str = "buy_item";
        let keyspace = self.collection(OP)?;

        let bought = match bought {
            Some(value) => value,
            None => !self.read(OP, keyspace, key).await?.bought,
        };

        let updates = [
            FieldUpdate::new("bought", bought),
            FieldUpdate::new("updated", now_millis()),
        ];
        self.shared
            .cluster
            .mutate_in(keyspace, key, &updates)
            .await
            .map_err(|e| StoreError::persistence(OP, key, e))?;
        tracing::info!("Item {} marked bought={}", key, bought);
        Ok(())
    }

    /// Remove an item regardless of this handle's view.
    pub async fn delete_item(&self, key: &str) -> Result<()> {
        const OP: &str = "delete_item";
        let keyspace = self.collection(OP)?;
        self.shared
            .cluster
            .remove(keyspace, key)
            .await
            .map_err(|e| StoreError::persistence(OP, key, e))?;
        tracing::info!("Item deleted: {}", key);
        Ok(())
    }

    /// Ping the services behind the bucket and return the JSON report.
    pub async fn ping(&self) -> Result<String> {
        const OP: &str = "ping";
        let report = self
            .shared
            .cluster
            .ping(&self.shared.bucket)
            .await
            .map_err(|e| StoreError::Connection(format!("{}: {}", OP, e)))?;
        let text = serde_json::to_string(&report).map_err(|e| StoreError::Query {
            op: OP,
            message: format!("encode report: {}", e),
        })?;
        if !report.is_healthy() {
            tracing::warn!("Ping report not healthy: {}", text);
            return Err(StoreError::Unhealthy { op: OP, report: text });
        }
        Ok(text)
    }

    async fn read(&self, op: &'static str, keyspace: &Keyspace, key: &str) -> Result<Item> {
        let doc = self
            .shared
            .cluster
            .get(keyspace, key)
            .await
            .map_err(|e| StoreError::persistence(op, key, e))?;
        decode_item(op, doc)
    }
}

fn decode_item(op: &'static str, doc: serde_json::Value) -> Result<Item> {
    serde_json::from_value(doc).map_err(|e| StoreError::Persistence {
        op,
        message: format!("decode item: {}", e),
    })
}
