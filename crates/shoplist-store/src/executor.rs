//! Paired execution of the list and count statements.

use std::time::Duration;

use crate::cluster::{Cluster, Keyspace};
use crate::error::{Result, StoreError};
use crate::item::{ItemWithId, Total};
use crate::statement::StatementPair;

const OP: &str = "get_items";

/// Run `pair.fetch` and `pair.count` concurrently against `keyspace`.
///
/// Both statements are in flight at the same time. The first failure is
/// returned and the other statement is dropped mid-flight; dropping the
/// returned future cancels both. The two reads are independent, so `total`
/// may disagree with the page under concurrent writes.
pub async fn fetch_and_count(
    cluster: &dyn Cluster,
    keyspace: &Keyspace,
    pair: &StatementPair,
    timeout: Option<Duration>,
) -> Result<(Vec<ItemWithId>, u64)> {
    let fetch = async {
        let rows = cluster
            .query(keyspace, &pair.fetch)
            .await
            .map_err(|e| StoreError::query(OP, e))?;
        let items = rows
            .into_iter()
            .map(|row| {
                serde_json::from_value::<ItemWithId>(row).map_err(|e| StoreError::Query {
                    op: OP,
                    message: format!("decode row: {}", e),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok::<_, StoreError>(items)
    };

    let count = async {
        let rows = cluster
            .query(keyspace, &pair.count)
            .await
            .map_err(|e| StoreError::query(OP, e))?;
        let row = rows
            .into_iter()
            .next()
            .ok_or(StoreError::CountMissing { op: OP })?;
        let total: Total = serde_json::from_value(row).map_err(|e| StoreError::Query {
            op: OP,
            message: format!("decode count: {}", e),
        })?;
        Ok::<_, StoreError>(total.total)
    };

    let both = async { tokio::try_join!(fetch, count) };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, both)
            .await
            .map_err(|_| StoreError::Query {
                op: OP,
                message: format!("timed out after {:?}", limit),
            })?,
        None => both.await,
    }
}
