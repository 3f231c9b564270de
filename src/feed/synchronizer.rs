//! Reconciles the partition topology with the lease collection.
//!
//! - [`PartitionSynchronizer::create_missing_leases`] creates one lease per
//!   partition that has none
//! - [`PartitionSynchronizer::split_partition`] creates leases for the children
//!   of a split partition, seeded with the parent's continuation
//!
//! Both list the topology to the end before diffing, so recently split ranges
//! on later pages are never missed. Lease creation is idempotent across hosts:
//! a lease created by a racing host counts as already satisfied.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use super::error::{FeedError, FeedResult};
use super::lease::Lease;
use super::retry;
use super::traits::{ChangeFeedSource, LeaseManager};
use crate::types::{PartitionId, PartitionRange};

/// Lease reconciliation operations.
#[async_trait]
pub trait PartitionSynchronizer: Send + Sync {
    /// Create a lease, with no continuation, for every partition without one.
    async fn create_missing_leases(&self) -> FeedResult<()>;

    /// Create leases for the children of the split partition of `lease`.
    ///
    /// Returns only the leases this call created. Fails with
    /// [`FeedError::InvalidOperation`] when fewer than two children exist.
    async fn split_partition(&self, lease: &Lease) -> FeedResult<Vec<Lease>>;
}

/// [`PartitionSynchronizer`] over a change feed source and a lease manager.
pub struct SourcePartitionSynchronizer {
    source: Arc<dyn ChangeFeedSource>,
    lease_manager: Arc<dyn LeaseManager>,
    degree_of_parallelism: usize,
    max_batch_size: u32,
}

impl SourcePartitionSynchronizer {
    pub fn new(
        source: Arc<dyn ChangeFeedSource>,
        lease_manager: Arc<dyn LeaseManager>,
        degree_of_parallelism: usize,
        max_batch_size: u32,
    ) -> Self {
        Self {
            source,
            lease_manager,
            degree_of_parallelism: degree_of_parallelism.max(1),
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Every current partition, following continuations until the listing ends.
    pub async fn list_all_partitions(&self) -> FeedResult<Vec<PartitionRange>> {
        let mut partitions = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let token = continuation.clone();
            let page = retry::retry_store("topology", retry::topology_policy(), || {
                self.source
                    .list_partitions(token.as_deref(), self.max_batch_size)
            })
            .await?;
            partitions.extend(page.partitions);
            match page.continuation {
                Some(next) if !next.is_empty() => continuation = Some(next),
                _ => break,
            }
        }
        Ok(partitions)
    }

    async fn create_lease(
        &self,
        partition_id: &PartitionId,
        continuation_token: Option<&str>,
    ) -> FeedResult<Option<Lease>> {
        let created = retry::retry_feed("lease_create", retry::lease_policy(), || {
            self.lease_manager
                .create_lease_if_not_exists(partition_id, continuation_token)
        })
        .await?;
        match &created {
            Some(_) => info!(partition_id = %partition_id, "Created lease"),
            None => debug!(partition_id = %partition_id, "Lease already exists"),
        }
        Ok(created)
    }

    async fn create_leases(
        &self,
        partition_ids: Vec<PartitionId>,
        continuation_token: Option<&str>,
    ) -> FeedResult<Vec<Lease>> {
        let created: Vec<Option<Lease>> = stream::iter(partition_ids)
            .map(|pid| async move { self.create_lease(&pid, continuation_token).await })
            .buffer_unordered(self.degree_of_parallelism)
            .try_collect()
            .await?;
        Ok(created.into_iter().flatten().collect())
    }
}

#[async_trait]
impl PartitionSynchronizer for SourcePartitionSynchronizer {
    async fn create_missing_leases(&self) -> FeedResult<()> {
        let partitions = self.list_all_partitions().await?;
        let existing: HashSet<PartitionId> = self
            .lease_manager
            .list_all_leases()
            .await?
            .into_iter()
            .map(|l| l.partition_id)
            .collect();

        let missing: Vec<PartitionId> = partitions
            .into_iter()
            .map(|p| p.id)
            .filter(|id| !existing.contains(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        if missing.is_empty() {
            debug!(existing = existing.len(), "No missing leases");
            return Ok(());
        }
        info!(missing = missing.len(), "Creating missing leases");
        self.create_leases(missing, None).await?;
        Ok(())
    }

    async fn split_partition(&self, lease: &Lease) -> FeedResult<Vec<Lease>> {
        let parent = &lease.partition_id;
        let children: Vec<PartitionId> = self
            .list_all_partitions()
            .await?
            .into_iter()
            .filter(|p| p.is_child_of(parent))
            .map(|p| p.id)
            .collect();

        if children.len() < 2 {
            warn!(
                partition_id = %parent,
                children = children.len(),
                "Split partition has fewer than two children"
            );
            return Err(FeedError::InvalidOperation(format!(
                "partition {parent} split into {} children, expected at least 2",
                children.len()
            )));
        }

        info!(
            partition_id = %parent,
            children = ?children.iter().map(PartitionId::as_str).collect::<Vec<_>>(),
            "Partition split"
        );
        self.create_leases(children, lease.continuation_token.as_deref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, StoreErrorKind};
    use crate::feed::memory::{InMemoryChangeFeed, InMemoryLeaseManager};

    fn synchronizer(
        feed: &InMemoryChangeFeed,
        leases: &InMemoryLeaseManager,
        batch: u32,
    ) -> SourcePartitionSynchronizer {
        SourcePartitionSynchronizer::new(
            Arc::new(feed.clone()),
            Arc::new(leases.clone()),
            4,
            batch,
        )
    }

    #[tokio::test]
    async fn test_listing_drains_all_pages() {
        let feed = InMemoryChangeFeed::with_partitions(7).await;
        let leases = InMemoryLeaseManager::new("a");
        let all = synchronizer(&feed, &leases, 3)
            .list_all_partitions()
            .await
            .unwrap();
        assert_eq!(all.len(), 7);
        assert_eq!(feed.list_count(), 3);
    }

    #[tokio::test]
    async fn test_create_missing_leases_keeps_existing() {
        let feed = InMemoryChangeFeed::with_partitions(5).await;
        let leases = InMemoryLeaseManager::new("a");
        let existing = leases
            .create_lease_if_not_exists(&PartitionId::new("2"), Some("40"))
            .await
            .unwrap()
            .unwrap();

        synchronizer(&feed, &leases, 2)
            .create_missing_leases()
            .await
            .unwrap();

        let all = leases.list_all_leases().await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(leases.get("2").await.unwrap(), existing);
        assert!(all
            .iter()
            .filter(|l| l.partition_id.as_str() != "2")
            .all(|l| l.continuation_token.is_none()));
    }

    #[tokio::test]
    async fn test_create_missing_leases_retries_throttled_listing() {
        let feed = InMemoryChangeFeed::with_partitions(2).await;
        feed.fail_next_list(StoreError::throttled(std::time::Duration::from_millis(1)))
            .await;
        let leases = InMemoryLeaseManager::new("a");
        synchronizer(&feed, &leases, 10)
            .create_missing_leases()
            .await
            .unwrap();
        assert_eq!(leases.list_all_leases().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_missing_leases_surfaces_fatal_listing_error() {
        let feed = InMemoryChangeFeed::with_partitions(2).await;
        feed.fail_next_list(StoreError::new(StoreErrorKind::Other, "forbidden"))
            .await;
        let leases = InMemoryLeaseManager::new("a");
        let err = synchronizer(&feed, &leases, 10)
            .create_missing_leases()
            .await
            .unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::Other));
        assert_eq!(leases.create_count(), 0);
    }

    #[tokio::test]
    async fn test_split_seeds_children_with_parent_continuation() {
        let feed = InMemoryChangeFeed::with_partitions(1).await;
        feed.split("0", &["1", "2"]).await.unwrap();
        let leases = InMemoryLeaseManager::new("a");
        let mut parent = Lease::new("", PartitionId::new("0"), None);
        parent.continuation_token = Some("17".to_string());

        let mut created = synchronizer(&feed, &leases, 10)
            .split_partition(&parent)
            .await
            .unwrap();
        created.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        assert_eq!(created.len(), 2);
        assert!(created
            .iter()
            .all(|l| l.continuation_token.as_deref() == Some("17")));
    }

    #[tokio::test]
    async fn test_split_excludes_children_created_by_racing_host() {
        let feed = InMemoryChangeFeed::with_partitions(1).await;
        feed.split("0", &["1", "2", "3"]).await.unwrap();
        let leases = InMemoryLeaseManager::new("a");
        leases
            .create_lease_if_not_exists(&PartitionId::new("2"), Some("5"))
            .await
            .unwrap();
        let parent = Lease::new("", PartitionId::new("0"), Some("9".to_string()));

        let created = synchronizer(&feed, &leases, 10)
            .split_partition(&parent)
            .await
            .unwrap();
        let mut ids: Vec<_> = created.iter().map(|l| l.partition_id.to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(
            leases.get("2").await.unwrap().continuation_token.as_deref(),
            Some("5")
        );
    }

    #[tokio::test]
    async fn test_split_with_single_child_is_invalid() {
        let feed = InMemoryChangeFeed::with_partitions(1).await;
        feed.split("0", &["1"]).await.unwrap();
        let leases = InMemoryLeaseManager::new("a");
        let parent = Lease::new("", PartitionId::new("0"), None);

        let err = synchronizer(&feed, &leases, 10)
            .split_partition(&parent)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::InvalidOperation(_)));
        assert_eq!(leases.create_count(), 0);
    }
}
