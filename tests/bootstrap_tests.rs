//! Bootstrap of a shared lease store by racing hosts.

use std::sync::Arc;
use std::time::Duration;

use leasefeed::feed::memory::{InMemoryChangeFeed, InMemoryDocumentStore, InMemoryLeaseManager};
use leasefeed::feed::{Bootstrapper, PartitionSynchronizer, SourcePartitionSynchronizer};
use leasefeed::prelude::*;

fn bootstrapper(
    feed: &InMemoryChangeFeed,
    leases: &InMemoryLeaseManager,
    documents: &Arc<InMemoryDocumentStore>,
    host: &str,
) -> (Bootstrapper, Arc<DocumentLeaseStore<InMemoryDocumentStore>>) {
    let synchronizer: Arc<dyn PartitionSynchronizer> = Arc::new(SourcePartitionSynchronizer::new(
        Arc::new(feed.clone()),
        Arc::new(leases.for_host(host)),
        4,
        2,
    ));
    let store = Arc::new(DocumentLeaseStore::new(documents.clone(), "orders", host));
    let bootstrapper = Bootstrapper::new(
        synchronizer,
        store.clone(),
        Duration::from_secs(30),
        Duration::from_millis(10),
    )
    .unwrap();
    (bootstrapper, store)
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_racing_hosts_create_each_lease_once() {
    let feed = InMemoryChangeFeed::with_partitions(9).await;
    let leases = InMemoryLeaseManager::new("seed");
    let documents = Arc::new(InMemoryDocumentStore::new());

    let hosts: Vec<_> = (0..5)
        .map(|i| bootstrapper(&feed, &leases, &documents, &format!("host-{i}")))
        .collect();
    let results =
        futures::future::join_all(hosts.iter().map(|(b, _)| b.initialize())).await;

    assert!(results.into_iter().all(|r| r.is_ok()));
    assert_eq!(leases.create_count(), 9);
    assert_eq!(leases.list_all_leases().await.unwrap().len(), 9);
    for (_, store) in &hosts {
        assert!(store.is_initialized().await.unwrap());
    }
}

#[tokio::test]
async fn test_existing_leases_are_left_alone() {
    let feed = InMemoryChangeFeed::with_partitions(3).await;
    let leases = InMemoryLeaseManager::new("a");
    let existing = leases
        .create_lease_if_not_exists(&PartitionId::new("1"), Some("42"))
        .await
        .unwrap()
        .unwrap();
    let documents = Arc::new(InMemoryDocumentStore::new());

    let (b, _) = bootstrapper(&feed, &leases, &documents, "a");
    b.initialize().await.unwrap();

    let after = leases.get("1").await.unwrap();
    assert_eq!(after.continuation_token.as_deref(), Some("42"));
    assert_eq!(after.version, existing.version);
    assert!(leases.get("0").await.unwrap().continuation_token.is_none());
    assert!(leases.get("2").await.unwrap().continuation_token.is_none());
}

// ============================================================================
// Failure
// ============================================================================

#[tokio::test]
async fn test_failed_bootstrap_can_be_retried_by_another_host() {
    let feed = InMemoryChangeFeed::with_partitions(2).await;
    feed.fail_next_list(StoreError::new(StoreErrorKind::Other, "listing broke"))
        .await;
    let leases = InMemoryLeaseManager::new("a");
    let documents = Arc::new(InMemoryDocumentStore::new());

    let (first, store) = bootstrapper(&feed, &leases, &documents, "a");
    assert!(first.initialize().await.is_err());
    assert!(!store.is_initialized().await.unwrap());
    assert_eq!(leases.create_count(), 0);

    // the failed host released its lock, so another host gets it right away
    let (second, _) = bootstrapper(&feed, &leases, &documents, "b");
    tokio::time::timeout(Duration::from_secs(1), second.initialize())
        .await
        .expect("lock was released")
        .unwrap();
    assert!(store.is_initialized().await.unwrap());
    assert_eq!(leases.create_count(), 2);
}

#[tokio::test]
async fn test_initialized_store_skips_synchronization() {
    let feed = InMemoryChangeFeed::with_partitions(2).await;
    let leases = InMemoryLeaseManager::new("a");
    let documents = Arc::new(InMemoryDocumentStore::new());
    let (b, store) = bootstrapper(&feed, &leases, &documents, "a");
    store.mark_initialized().await.unwrap();

    b.initialize().await.unwrap();
    assert_eq!(feed.list_count(), 0);
    assert_eq!(leases.create_count(), 0);
}
