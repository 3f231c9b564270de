//! Collaborator traits for the change feed processor.
//!
//! These traits abstract everything outside the processing core, allowing for:
//! - Different store backends behind one read loop
//! - Testing with the in-memory implementations in [`memory`](super::memory)
//! - A clear line between the core and the data-store client
//!
//! # Trait Hierarchy
//!
//! - [`ChangeFeedSource`]: partition topology and per-partition change pages
//! - [`DocumentStore`]: point document reads/creates/deletes backing the
//!   bootstrap markers
//! - [`LeaseStore`]: bootstrap primitives built on a document store
//! - [`LeaseManager`]: per-partition lease records with optimistic concurrency

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::FeedResult;
use super::lease::Lease;
use crate::error::StoreError;
use crate::types::{Document, PartitionId, PartitionRange, StartPosition};

/// One page of the partition topology listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionPage {
    /// Partitions on this page.
    pub partitions: Vec<PartitionRange>,
    /// Token for the next page; `None` when the listing is drained.
    pub continuation: Option<String>,
}

/// A request for the next page of changes of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFeedRequest {
    /// Partition to read.
    pub partition_id: PartitionId,
    /// Where to start reading.
    pub start: StartPosition,
    /// Page-size hint; `None` lets the store decide.
    pub max_item_count: Option<u32>,
}

/// A page of changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeFeedPage {
    /// Changes in stream order.
    pub documents: Vec<Document>,
    /// Resume point after this page.
    pub continuation: String,
    /// Session token; its global LSN is the latest position of the partition.
    pub session_token: String,
    /// True when the store has more changes available right now.
    pub has_more_results: bool,
}

impl ChangeFeedPage {
    /// Number of changes on the page.
    #[inline]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// True when the page carries no changes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Source store client for topology listing and change pages.
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    /// List one page of the current partitions.
    async fn list_partitions(
        &self,
        continuation: Option<&str>,
        max_items: u32,
    ) -> Result<PartitionPage, StoreError>;

    /// Read the next page of changes.
    ///
    /// Implementations should abort promptly when `cancel` fires, reporting
    /// [`StoreErrorKind::Canceled`](crate::error::StoreErrorKind::Canceled).
    async fn read_changes(
        &self,
        request: &ChangeFeedRequest,
        cancel: &CancellationToken,
    ) -> Result<ChangeFeedPage, StoreError>;
}

/// Point document operations with not-found/conflict signaling.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a document; `Ok(None)` when it does not exist.
    async fn read_document(&self, id: &str) -> Result<Option<Document>, StoreError>;

    /// Create a document, failing with a conflict if it exists.
    ///
    /// With a `ttl`, the store deletes the document once it expires.
    async fn create_document(
        &self,
        id: &str,
        body: Document,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Delete a document; `Ok(false)` when it did not exist.
    async fn delete_document(&self, id: &str) -> Result<bool, StoreError>;
}

/// Bootstrap primitives of the lease store.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// True once some host finished bootstrapping.
    async fn is_initialized(&self) -> FeedResult<bool>;

    /// Mark the store bootstrapped. Idempotent.
    async fn mark_initialized(&self) -> FeedResult<()>;

    /// Try to take the bootstrap lock for `lock_time`.
    ///
    /// Returns `true` only when this call created the lock.
    async fn lock_initialization(&self, lock_time: Duration) -> FeedResult<bool>;

    /// Release the bootstrap lock. Returns `false` if it was already gone.
    async fn release_initialization_lock(&self) -> FeedResult<bool>;
}

/// Lease records for partitions.
///
/// Every write is conditional on ownership: an operation on a lease this host
/// no longer owns fails with [`FeedError::LeaseLost`](super::FeedError::LeaseLost).
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Name of the host this manager writes ownership for.
    fn host_name(&self) -> &str;

    /// All leases of the lease store.
    async fn list_all_leases(&self) -> FeedResult<Vec<Lease>>;

    /// Leases owned by this host.
    async fn list_owned_leases(&self) -> FeedResult<Vec<Lease>> {
        let host = self.host_name().to_string();
        Ok(self
            .list_all_leases()
            .await?
            .into_iter()
            .filter(|l| l.is_owned_by(&host))
            .collect())
    }

    /// Create a lease unless one exists.
    ///
    /// Returns `None` when another host created it first.
    async fn create_lease_if_not_exists(
        &self,
        partition_id: &PartitionId,
        continuation_token: Option<&str>,
    ) -> FeedResult<Option<Lease>>;

    /// Take ownership of a lease last seen as `lease`.
    async fn acquire(&self, lease: &Lease) -> FeedResult<Lease>;

    /// Extend ownership of a lease this host owns.
    async fn renew(&self, lease: &Lease) -> FeedResult<Lease>;

    /// Give up ownership of a lease this host owns.
    async fn release(&self, lease: &Lease) -> FeedResult<()>;

    /// Persist a continuation token on a lease this host owns.
    async fn checkpoint(&self, lease: &Lease, continuation_token: &str) -> FeedResult<Lease>;

    /// Replace the properties of a lease this host owns.
    async fn update_properties(&self, lease: &Lease) -> FeedResult<Lease>;

    /// Delete a lease. Deleting a missing lease is not an error.
    async fn delete(&self, lease: &Lease) -> FeedResult<()>;
}
