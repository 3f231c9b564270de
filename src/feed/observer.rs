//! The consumer extension point.
//!
//! Consumers implement [`ChangeFeedObserver`] and hand the processor an
//! [`ObserverFactory`]. One observer instance is created per owned partition;
//! it is opened before the first page, receives pages in stream order, and is
//! always closed with a [`CloseReason`] when processing of the partition ends.
//!
//! Delivery is at-least-once: after a crash or an ownership change the same
//! changes may be delivered again, starting from the last checkpoint.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::checkpointer::PartitionCheckpointer;
use super::error::{BoxError, FeedError, FeedResult};
use super::traits::ChangeFeedPage;
use crate::types::{Document, PartitionId};

/// Why an observer is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Unclassified failure.
    Unknown,
    /// The host is shutting down or gave the partition up.
    Shutdown,
    /// The partition no longer exists.
    ResourceGone,
    /// Another host took the lease.
    LeaseLost,
    /// The observer itself failed.
    ObserverError,
    /// The partition split; its children take over.
    LeaseGone,
    /// The store could not serve a session read.
    ReadSessionNotAvailable,
}

impl CloseReason {
    /// Returns a string label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            CloseReason::Unknown => "unknown",
            CloseReason::Shutdown => "shutdown",
            CloseReason::ResourceGone => "resource_gone",
            CloseReason::LeaseLost => "lease_lost",
            CloseReason::ObserverError => "observer_error",
            CloseReason::LeaseGone => "lease_gone",
            CloseReason::ReadSessionNotAvailable => "read_session_not_available",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_metric_label())
    }
}

/// What an observer knows about the delivery at hand.
///
/// Contexts handed to `open`/`close` carry no page; contexts handed to
/// `process_changes` carry the page and a checkpoint bound to its continuation.
#[derive(Clone)]
pub struct ObserverContext {
    partition_id: PartitionId,
    page: Option<Arc<ChangeFeedPage>>,
    checkpointer: Option<Arc<PartitionCheckpointer>>,
}

impl ObserverContext {
    /// A context without a page, for `open` and `close`.
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            page: None,
            checkpointer: None,
        }
    }

    /// A context for one delivered page.
    pub fn for_page(
        partition_id: PartitionId,
        page: Arc<ChangeFeedPage>,
        checkpointer: Arc<PartitionCheckpointer>,
    ) -> Self {
        Self {
            partition_id,
            page: Some(page),
            checkpointer: Some(checkpointer),
        }
    }

    pub fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    /// The raw page being delivered.
    pub fn page(&self) -> Option<&ChangeFeedPage> {
        self.page.as_deref()
    }

    /// Continuation token of the page being delivered.
    pub fn continuation(&self) -> Option<&str> {
        self.page.as_deref().map(|p| p.continuation.as_str())
    }

    /// Persist this page's continuation as the partition's progress.
    ///
    /// Fails with [`FeedError::LeaseLost`] when another host owns the lease,
    /// and with [`FeedError::InvalidOperation`] on contexts without a page.
    pub async fn checkpoint(&self) -> FeedResult<()> {
        match (&self.page, &self.checkpointer) {
            (Some(page), Some(checkpointer)) => {
                checkpointer.checkpoint_partition(&page.continuation).await
            }
            _ => Err(FeedError::InvalidOperation(format!(
                "no page to checkpoint for partition {}",
                self.partition_id
            ))),
        }
    }
}

impl fmt::Debug for ObserverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverContext")
            .field("partition_id", &self.partition_id)
            .field("continuation", &self.continuation())
            .finish()
    }
}

/// Consumer of the changes of one partition.
///
/// Errors may be of any type; they reach the host as
/// [`FeedError::Observer`]. A [`FeedError::LeaseLost`] returned from an
/// explicit [`ObserverContext::checkpoint`] passes through unchanged.
#[async_trait]
pub trait ChangeFeedObserver: Send + Sync {
    /// Called once before the first delivery.
    async fn open(&self, _context: &ObserverContext) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called once when processing of the partition ends.
    async fn close(&self, _context: &ObserverContext, _reason: CloseReason) -> Result<(), BoxError> {
        Ok(())
    }

    /// Handle one non-empty page of changes, in stream order.
    async fn process_changes(
        &self,
        context: &ObserverContext,
        changes: Vec<Document>,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError>;
}

/// Creates one observer per owned partition.
pub trait ObserverFactory: Send + Sync {
    fn create_observer(&self) -> Arc<dyn ChangeFeedObserver>;
}

impl<F> ObserverFactory for F
where
    F: Fn() -> Arc<dyn ChangeFeedObserver> + Send + Sync,
{
    fn create_observer(&self) -> Arc<dyn ChangeFeedObserver> {
        self()
    }
}
