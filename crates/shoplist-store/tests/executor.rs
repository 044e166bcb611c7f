//! Paired list and count execution against a scripted cluster

mod common;

use std::time::{Duration, Instant};

use common::{Fault, MockCluster};
use serde_json::json;
use shoplist_store::executor::fetch_and_count;
use shoplist_store::statement::build_statements;
use shoplist_store::{BoughtFilter, ErrorKind, Keyspace, PaginationQuery};

fn keyspace() -> Keyspace {
    Keyspace::new("shoppinglist", "0", "items")
}

fn row(id: &str, title: &str) -> serde_json::Value {
    json!({"id": id, "title": title, "amount": 1.0, "unit": "pc", "bought": false,
           "shop": "Rewe", "created": 1, "updated": 1})
}

#[tokio::test]
async fn test_rows_and_total() {
    let cluster = MockCluster::new()
        .rows(vec![row("a", "Milk"), row("b", "Bread")])
        .count(vec![json!({"total": 7})]);
    let q = PaginationQuery::new().window(0, 2);
    let pair = build_statements(BoughtFilter::Unfiltered, &q).unwrap();

    let (items, total) = fetch_and_count(&cluster, &keyspace(), &pair, None).await.unwrap();
    assert_eq!(total, 7);
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].id, "a");
    assert_eq!(items[1].item.title, "Bread");
}

#[tokio::test]
async fn test_missing_count_row() {
    let cluster = MockCluster::new().rows(vec![row("a", "Milk")]);
    let pair = build_statements(BoughtFilter::Unfiltered, &PaginationQuery::new()).unwrap();

    let err = fetch_and_count(&cluster, &keyspace(), &pair, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CountMissing);
}

#[tokio::test]
async fn test_both_statements_run_concurrently() {
    let cluster = MockCluster::new()
        .count(vec![json!({"total": 0})])
        .delays(Duration::from_millis(300), Duration::from_millis(300));
    let pair = build_statements(BoughtFilter::Unfiltered, &PaginationQuery::new()).unwrap();

    let started = Instant::now();
    fetch_and_count(&cluster, &keyspace(), &pair, None).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(550));
}

#[tokio::test]
async fn test_first_error_wins_without_waiting_for_sibling() {
    let cluster = MockCluster::new()
        .fail("query_rows", Fault::Storage)
        .count(vec![json!({"total": 3})])
        .delays(Duration::ZERO, Duration::from_secs(30));
    let pair = build_statements(BoughtFilter::Unfiltered, &PaginationQuery::new()).unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        fetch_and_count(&cluster, &keyspace(), &pair, None),
    )
    .await
    .expect("error should surface before the count finishes");
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Query);
}

#[tokio::test]
async fn test_count_failure_is_a_query_error() {
    let cluster = MockCluster::new()
        .rows(vec![row("a", "Milk")])
        .fail("query_count", Fault::Unavailable);
    let pair = build_statements(BoughtFilter::OnlyBought, &PaginationQuery::new()).unwrap();

    let err = fetch_and_count(&cluster, &keyspace(), &pair, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
}

#[tokio::test]
async fn test_deadline_covers_both_statements() {
    let cluster = MockCluster::new()
        .count(vec![json!({"total": 1})])
        .delays(Duration::from_secs(30), Duration::ZERO);
    let pair = build_statements(BoughtFilter::Unfiltered, &PaginationQuery::new()).unwrap();

    let err = fetch_and_count(&cluster, &keyspace(), &pair, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn test_undecodable_row() {
    let cluster = MockCluster::new()
        .rows(vec![json!({"title": "no id"})])
        .count(vec![json!({"total": 1})]);
    let pair = build_statements(BoughtFilter::Unfiltered, &PaginationQuery::new()).unwrap();

    let err = fetch_and_count(&cluster, &keyspace(), &pair, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
}

#[tokio::test]
async fn test_statements_target_the_keyspace() {
    let cluster = MockCluster::new().count(vec![json!({"total": 0})]);
    let pair = build_statements(BoughtFilter::Unfiltered, &PaginationQuery::new()).unwrap();
    fetch_and_count(&cluster, &keyspace(), &pair, None).await.unwrap();

    let calls = cluster.calls();
    assert!(calls.contains(&"query_rows:items".to_string()));
    assert!(calls.contains(&"query_count:items".to_string()));
}
