//! Item lifecycle over the embedded engine

#![cfg(feature = "sqlite")]

use std::sync::Arc;

use shoplist_store::{
    item_key, seed_sample_items, BoughtFilter, Cluster, ErrorKind, Item, ItemStore,
    PaginationQuery, SortOrder, SqliteCluster, StoreConfig,
};

async fn open_store() -> ItemStore {
    ItemStore::connect(&StoreConfig::in_memory()).await.unwrap()
}

fn titles(items: &[shoplist_store::ItemWithId]) -> Vec<&str> {
    items.iter().map(|i| i.item.title.as_str()).collect()
}

#[tokio::test]
async fn test_generated_key_and_first_timestamps() {
    let store = open_store().await;
    let stored = store
        .upsert_item("", Item::new("Milk", 2.0, "l"))
        .await
        .unwrap();

    assert!(!stored.id.is_empty());
    assert!(uuid::Uuid::parse_str(&stored.id).is_ok());
    assert!(stored.item.created > 0);
    assert_eq!(stored.item.created, stored.item.updated);
    assert_eq!(stored.item.title, "Milk");
}

#[tokio::test]
async fn test_reupsert_keeps_created_and_advances_updated() {
    let store = open_store().await;
    let first = store
        .upsert_item("item:Milk", Item::new("Milk", 1.0, "l"))
        .await
        .unwrap();

    // Caller sends back what it read.
    let second = store
        .upsert_item(&first.id, first.item.clone())
        .await
        .unwrap();
    assert_eq!(second.item.created, first.item.created);
    assert!(second.item.updated > first.item.updated);

    // Caller sends a fresh body without timestamps.
    let third = store
        .upsert_item(&first.id, Item::new("Milk", 3.0, "l"))
        .await
        .unwrap();
    assert_eq!(third.item.created, first.item.created);
    assert!(third.item.updated > second.item.updated);
    assert_eq!(third.item.amount, 3.0);
}

#[tokio::test]
async fn test_filtered_handle_reports_absent() {
    let store = open_store().await;
    let milk = store
        .upsert_item("", Item::new("Milk", 1.0, "l"))
        .await
        .unwrap();

    let bought = store.view(BoughtFilter::OnlyBought);
    assert_eq!(bought.get_item(&milk.id).await.unwrap(), None);

    let to_buy = store.view(BoughtFilter::OnlyUnbought);
    assert_eq!(to_buy.get_item(&milk.id).await.unwrap(), Some(milk));
}

#[tokio::test]
async fn test_set_then_toggle() {
    let store = open_store().await;
    let bread = store
        .upsert_item("", Item::new("Bread", 1.0, "pc"))
        .await
        .unwrap();

    store.buy_item(&bread.id, Some(true)).await.unwrap();
    let after_buy = store.get_item(&bread.id).await.unwrap().unwrap();
    assert!(after_buy.item.bought);
    assert!(after_buy.item.updated >= bread.item.updated);
    assert_eq!(after_buy.item.created, bread.item.created);
    assert_eq!(after_buy.item.title, "Bread");

    store.buy_item(&bread.id, None).await.unwrap();
    let after_toggle = store.get_item(&bread.id).await.unwrap().unwrap();
    assert!(!after_toggle.item.bought);

    store.buy_item(&bread.id, Some(false)).await.unwrap();
    assert!(!store.get_item(&bread.id).await.unwrap().unwrap().item.bought);
}

#[tokio::test]
async fn test_buy_missing_key() {
    let store = open_store().await;
    let err = store.buy_item("nope", Some(true)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = store.buy_item("nope", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_unbounded_and_windowed_listing() {
    let store = open_store().await;
    for i in 0..7 {
        store
            .upsert_item(&format!("k{}", i), Item::new(format!("Item {}", i), 1.0, "pc"))
            .await
            .unwrap();
    }

    let (all, total) = store.get_items(&PaginationQuery::new()).await.unwrap();
    assert_eq!(all.len(), 7);
    assert_eq!(total, 7);

    let (page, total) = store
        .get_items(&PaginationQuery::new().window(2, 5))
        .await
        .unwrap();
    assert_eq!(page.len(), 3);
    assert_eq!(total, 7);
    // Key order breaks ties when no sort is requested.
    let keys: Vec<_> = page.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(keys, vec!["k2", "k3", "k4"]);

    let (tail, _) = store
        .get_items(&PaginationQuery::new().window(5, 0))
        .await
        .unwrap();
    assert_eq!(tail.len(), 2);
}

#[tokio::test]
async fn test_window_end_before_start_is_rejected() {
    let store = open_store().await;
    let err = store
        .get_items(&PaginationQuery::new().window(5, 2))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidQuery);
}

#[tokio::test]
async fn test_delete_then_fetch() {
    let store = open_store().await;
    let wine = store
        .upsert_item("", Item::new("Wine", 1.0, "bottle"))
        .await
        .unwrap();

    // Deletes ignore the handle's view.
    store
        .view(BoughtFilter::OnlyBought)
        .delete_item(&wine.id)
        .await
        .unwrap();

    let err = store.get_item(&wine.id).await.unwrap_err();
    assert!(err.is_not_found());
    let err = store.delete_item(&wine.id).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_milk_and_bread() {
    let store = open_store().await;
    store
        .upsert_item("", Item::new("Milk", 1.0, "l").with_bought(false))
        .await
        .unwrap();
    store
        .upsert_item("", Item::new("Bread", 1.0, "pc").with_bought(true))
        .await
        .unwrap();

    let by_title = PaginationQuery::new().sort_by("title", SortOrder::Asc);
    let (items, total) = store.get_items(&by_title).await.unwrap();
    assert_eq!(titles(&items), vec!["Bread", "Milk"]);
    assert_eq!(total, 2);

    let (items, total) = store
        .view(BoughtFilter::OnlyUnbought)
        .get_items(&by_title)
        .await
        .unwrap();
    assert_eq!(titles(&items), vec!["Milk"]);
    assert_eq!(total, 1);

    let (items, _) = store
        .get_items(&by_title.clone().bought_last(true))
        .await
        .unwrap();
    assert_eq!(titles(&items), vec!["Milk", "Bread"]);

    let (items, _) = store
        .get_items(&PaginationQuery::new().sort_by("title", SortOrder::Desc))
        .await
        .unwrap();
    assert_eq!(titles(&items), vec!["Milk", "Bread"]);
}

#[tokio::test]
async fn test_search_matches_text_fields() {
    let store = open_store().await;
    store
        .upsert_item(
            "",
            Item::new("Cottage Cheese", 1.0, "pc")
                .with_shop("Rewe")
                .with_description("low fat"),
        )
        .await
        .unwrap();
    store
        .upsert_item("", Item::new("Milk", 1.0, "l").with_shop("Edeka"))
        .await
        .unwrap();

    let (items, total) = store
        .get_items(&PaginationQuery::new().search("cott"))
        .await
        .unwrap();
    assert_eq!(titles(&items), vec!["Cottage Cheese"]);
    assert_eq!(total, 1);

    let (_, total) = store
        .get_items(&PaginationQuery::new().search("fat"))
        .await
        .unwrap();
    assert_eq!(total, 1);

    // Blank search lists everything.
    let (_, total) = store
        .get_items(&PaginationQuery::new().search("   "))
        .await
        .unwrap();
    assert_eq!(total, 2);

    let (_, total) = store
        .view(BoughtFilter::OnlyBought)
        .get_items(&PaginationQuery::new().search("milk"))
        .await
        .unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn test_search_ranks_closer_matches_first() {
    let store = open_store().await;
    // Key order alone would put the chocolate first.
    store
        .upsert_item(
            "a-chocolate",
            Item::new("Chocolate Bar", 1.0, "pc").with_description(
                "dark chocolate made with whole milk powder, cocoa butter, cane sugar and vanilla",
            ),
        )
        .await
        .unwrap();
    store
        .upsert_item(
            "b-milk",
            Item::new("Milk", 1.0, "l").with_description("fresh milk"),
        )
        .await
        .unwrap();
    for (key, title) in [("c-bread", "Bread"), ("d-apples", "Apples"), ("e-wine", "Wine")] {
        store
            .upsert_item(key, Item::new(title, 1.0, "pc"))
            .await
            .unwrap();
    }

    let (items, total) = store
        .get_items(&PaginationQuery::new().search("milk"))
        .await
        .unwrap();
    assert_eq!(titles(&items), vec!["Milk", "Chocolate Bar"]);
    assert_eq!(total, 2);

    // An explicit sort replaces the ranking.
    let (items, _) = store
        .get_items(&PaginationQuery::new().search("milk").sort_by("title", SortOrder::Asc))
        .await
        .unwrap();
    assert_eq!(titles(&items), vec!["Chocolate Bar", "Milk"]);

    // Windows apply to the ranked order.
    let (items, total) = store
        .get_items(&PaginationQuery::new().search("milk").window(0, 1))
        .await
        .unwrap();
    assert_eq!(titles(&items), vec!["Milk"]);
    assert_eq!(total, 2);
}

#[tokio::test]
async fn test_search_text_is_not_interpolated() {
    let store = open_store().await;
    store
        .upsert_item("", Item::new("Milk", 1.0, "l"))
        .await
        .unwrap();
    let (items, total) = store
        .get_items(&PaginationQuery::new().search("x' OR 1=1 --"))
        .await
        .unwrap();
    assert!(items.is_empty());
    assert_eq!(total, 0);
}

#[tokio::test]
async fn test_seeding_is_repeatable() {
    let store = open_store().await;
    let first = seed_sample_items(&store).await.unwrap();
    assert_eq!(first.len(), 15);

    let second = seed_sample_items(&store).await.unwrap();
    let cheese = item_key("item", "Cottage Cheese");
    let before = first.iter().find(|i| i.id == cheese).unwrap();
    let after = second.iter().find(|i| i.id == cheese).unwrap();
    assert_eq!(before.item.created, after.item.created);

    let (to_buy, total) = store
        .view(BoughtFilter::OnlyUnbought)
        .get_items(&PaginationQuery::new())
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(to_buy[0].id, cheese);

    let (_, total) = store
        .view(BoughtFilter::OnlyBought)
        .get_items(&PaginationQuery::new())
        .await
        .unwrap();
    assert_eq!(total, 14);
}

#[tokio::test]
async fn test_ping_in_memory() {
    let store = open_store().await;
    let report: serde_json::Value = serde_json::from_str(&store.ping().await.unwrap()).unwrap();
    assert_eq!(report["services"]["kv"][0]["state"], "ok");
}

#[tokio::test]
async fn test_handles_share_one_cluster() {
    let store = open_store().await;
    let to_buy = store.view(BoughtFilter::OnlyUnbought);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .upsert_item(&format!("k{}", i), Item::new(format!("Item {}", i), 1.0, "pc"))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let (_, total) = to_buy.get_items(&PaginationQuery::new()).await.unwrap();
    assert_eq!(total, 8);
}

#[tokio::test]
async fn test_file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = StoreConfig::default();
    config.connection.connection_string =
        format!("sqlite://{}", dir.path().join("list.db").display());

    let id = {
        let store = ItemStore::connect(&config).await.unwrap();
        store
            .upsert_item("", Item::new("Plums", 6.0, "pc"))
            .await
            .unwrap()
            .id
    };

    // Second bootstrap finds everything already provisioned.
    let store = ItemStore::connect(&config).await.unwrap();
    let plums = store.get_item(&id).await.unwrap().unwrap();
    assert_eq!(plums.item.title, "Plums");
}

#[tokio::test]
async fn test_open_on_explicit_cluster() {
    let cluster = Arc::new(SqliteCluster::open_in_memory().unwrap());
    let config = StoreConfig::default();
    let store = ItemStore::open(cluster.clone(), &config).await.unwrap();
    let other = ItemStore::open(cluster, &config).await.unwrap();

    let milk = store
        .upsert_item("", Item::new("Milk", 1.0, "l"))
        .await
        .unwrap();
    assert!(other.get_item(&milk.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_ping_on_attach_leaves_cluster_untouched() {
    let cluster = Arc::new(SqliteCluster::open_in_memory().unwrap());
    let config = StoreConfig::default().without_collection();
    let store = ItemStore::attach(cluster.clone(), &config).await.unwrap();

    let err = store.ping().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unhealthy);

    // Still no bucket: creating it now is not a clash.
    cluster
        .create_bucket(&config.connection.bucket, 100)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_attach_to_provisioned_cluster() {
    let cluster = Arc::new(SqliteCluster::open_in_memory().unwrap());
    let config = StoreConfig::default();
    let store = ItemStore::open(cluster.clone(), &config).await.unwrap();
    let milk = store
        .upsert_item("", Item::new("Milk", 1.0, "l"))
        .await
        .unwrap();

    let attached = ItemStore::attach(cluster, &config).await.unwrap();
    assert_eq!(attached.get_item(&milk.id).await.unwrap(), Some(milk));
    assert!(attached.ping().await.is_ok());
}
