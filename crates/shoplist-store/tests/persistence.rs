//! Write-path failures against a scripted cluster

mod common;

use std::sync::Arc;

use common::{Fault, MockCluster};
use shoplist_store::{ErrorKind, Item, ItemStore, StoreConfig};

async fn open(cluster: &Arc<MockCluster>) -> ItemStore {
    ItemStore::open(cluster.clone(), &StoreConfig::default())
        .await
        .unwrap()
}

fn position(calls: &[String], op: &str) -> Option<usize> {
    let prefix = format!("{}:", op);
    calls.iter().position(|c| c.starts_with(&prefix))
}

#[tokio::test]
async fn test_failed_write_is_a_persistence_error() {
    let cluster = Arc::new(MockCluster::new().fail("upsert", Fault::Storage));
    let store = open(&cluster).await;

    let err = store
        .upsert_item("", Item::new("Milk", 1.0, "l"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);
    assert!(err.to_string().contains("upsert_item"));
    // Nothing to read back after a failed write.
    assert!(!cluster.called("get"));
}

#[tokio::test]
async fn test_failed_read_back_keeps_the_write() {
    let cluster = Arc::new(MockCluster::new().fail("get", Fault::Unavailable));
    let store = open(&cluster).await;

    let err = store
        .upsert_item("", Item::new("Milk", 1.0, "l"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);

    let calls = cluster.calls();
    let upsert = position(&calls, "upsert").expect("write was issued");
    let get = position(&calls, "get").expect("read back was attempted");
    assert!(upsert < get);
    assert!(!cluster.called("remove"));

    // Read-back targets the key that was written.
    assert_eq!(calls[upsert]["upsert:".len()..], calls[get]["get:".len()..]);
}

#[tokio::test]
async fn test_lookup_failure_before_write_is_a_persistence_error() {
    let cluster = Arc::new(MockCluster::new().fail("get", Fault::Storage));
    let store = open(&cluster).await;

    // A supplied key without `created` is looked up first.
    let err = store
        .upsert_item("item:Milk", Item::new("Milk", 1.0, "l"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);
    assert!(!cluster.called("upsert"));
}

#[tokio::test]
async fn test_failed_partial_replace_is_a_persistence_error() {
    let cluster = Arc::new(MockCluster::new().fail("mutate_in", Fault::Storage));
    let store = open(&cluster).await;

    let err = store.buy_item("item:Milk", Some(true)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);
}
