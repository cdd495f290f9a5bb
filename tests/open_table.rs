//! Table resolution: caching, single-flight and missing tables

use futures_util::future::join_all;
use minikv_client::testkit::MockCluster;
use minikv_client::{Client, Deadline, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_open_table_is_cached() {
    let cluster = MockCluster::builder().metas(3).table("temp", 8).start().await.unwrap();
    let client = Client::new(cluster.client_config()).unwrap();

    let first = client.open_table("temp", Duration::from_secs(5)).await.unwrap();
    let second = client.open_table("temp", Duration::from_secs(5)).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.partition_map().partition_count(), 8);
    assert_eq!(cluster.meta_queries("temp"), 1);
    assert_eq!(client.tables(), vec!["temp"]);
    assert!(client.shutdown(Duration::from_secs(2)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_open_issues_one_meta_query() {
    let cluster = MockCluster::builder().metas(3).table("temp", 8).start().await.unwrap();
    let client = Arc::new(Client::new(cluster.client_config()).unwrap());

    let opens = (0..100).map(|_| {
        let client = client.clone();
        tokio::spawn(async move { client.open_table("temp", Duration::from_secs(5)).await })
    });
    let connectors: Vec<_> = join_all(opens)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    for connector in &connectors[1..] {
        assert!(Arc::ptr_eq(&connectors[0], connector));
    }
    assert_eq!(cluster.meta_queries("temp"), 1);
    assert_eq!(client.metrics().meta_queries, 1);
    assert!(client.shutdown(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_nonexistent_table() {
    let cluster = MockCluster::builder().metas(3).table("temp", 8).start().await.unwrap();
    let client = Client::new(cluster.client_config()).unwrap();

    for _ in 0..3 {
        let err = client
            .open_table("no_such_table", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTable);
    }
    // failures are not cached
    assert_eq!(cluster.meta_queries("no_such_table"), 3);

    let err = client
        .get("no_such_table", b"h0", b"s0", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTable);
    assert!(err.to_string().starts_with("get on table no_such_table"));
    assert!(client.tables().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nonexistent_table_concurrent() {
    let cluster = MockCluster::builder().metas(3).start().await.unwrap();
    let client = Arc::new(Client::new(cluster.client_config()).unwrap());

    let opens = (0..100).map(|_| {
        let client = client.clone();
        tokio::spawn(async move { client.open_table("no_such_table", Duration::from_secs(5)).await })
    });
    for joined in join_all(opens).await {
        let err = joined.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTable);
    }
    assert!(cluster.meta_queries("no_such_table") >= 1);
    assert!(cluster.meta_queries("no_such_table") <= 100);
    assert!(client.shutdown(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_invalid_arguments() {
    let cluster = MockCluster::builder().table("temp", 4).start().await.unwrap();
    let client = Client::new(cluster.client_config()).unwrap();

    let err = client.open_table("", Deadline::none()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = client
        .set("temp", b"", b"s0", b"v0", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(cluster.key_count(), 0);
}
