//! Error types for change feed processing.
//!
//! # Propagation Policy
//!
//! ## Recovered Locally
//!
//! Transient store failures (throttling, server errors) and page-too-large
//! failures never leave the partition processor; it retries, backs off or
//! shrinks the page instead.
//!
//! ## Fatal to One Partition
//!
//! - [`FeedError::PartitionNotFound`] and [`FeedError::PartitionSplit`] stop the
//!   affected processor and carry the last continuation so the controller can
//!   re-lease the partition or fan out to its children.
//! - [`FeedError::LeaseLost`] stops the processor: another host owns the lease.
//! - [`FeedError::Observer`] wraps failures raised by consumer code so hosts can
//!   tell consumer bugs apart from store failures. Never retried.
//!
//! ## Surfaced As-Is
//!
//! Unclassified store errors propagate unchanged as [`FeedError::Store`].

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::observer::CloseReason;
use crate::error::{StoreError, StoreErrorKind};
use crate::types::PartitionId;

/// Result type for change feed processing.
pub type FeedResult<T> = Result<T, FeedError>;

/// Boxed error raised by consumer code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while processing a change feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// A store failure that was not recovered locally.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The partition no longer exists.
    #[error("Partition {partition_id} not found")]
    PartitionNotFound {
        partition_id: PartitionId,
        last_continuation: Option<String>,
    },

    /// The partition split into children.
    #[error("Partition {partition_id} split")]
    PartitionSplit {
        partition_id: PartitionId,
        last_continuation: Option<String>,
    },

    /// Another host owns the lease now.
    #[error("Lease for partition {partition_id} lost")]
    LeaseLost { partition_id: PartitionId },

    /// Consumer code failed.
    #[error("Observer failed for partition {partition_id}: {source}")]
    Observer {
        partition_id: PartitionId,
        #[source]
        source: BoxError,
    },

    /// An invariant of the processing model was violated.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was canceled through its cancellation token.
    #[error("Operation canceled")]
    Canceled,
}

impl FeedError {
    /// Wrap a consumer failure as an observer error.
    ///
    /// Infrastructure failures that travel through consumer code unchanged
    /// (store and lease-lost errors from a checkpoint, an already wrapped
    /// observer error) are returned as-is. Everything else, cancellation
    /// included, is consumer failure.
    pub fn observer(partition_id: &PartitionId, error: impl Into<BoxError>) -> Self {
        let boxed: BoxError = error.into();
        match boxed.downcast::<FeedError>() {
            Ok(feed) => match *feed {
                e @ (FeedError::Store(_) | FeedError::LeaseLost { .. } | FeedError::Observer { .. }) => {
                    e
                }
                other => FeedError::Observer {
                    partition_id: partition_id.clone(),
                    source: Box::new(other),
                },
            },
            Err(source) => FeedError::Observer {
                partition_id: partition_id.clone(),
                source,
            },
        }
    }

    /// Wrap the failure of a delivery made under `cancel`.
    ///
    /// Like [`FeedError::observer`], except that a cancellation is passed
    /// through when `cancel` has fired.
    pub fn delivery(
        partition_id: &PartitionId,
        error: impl Into<BoxError>,
        cancel: &CancellationToken,
    ) -> Self {
        let boxed: BoxError = error.into();
        let canceled = boxed
            .downcast_ref::<FeedError>()
            .is_some_and(FeedError::is_canceled);
        if canceled && cancel.is_cancelled() {
            return FeedError::Canceled;
        }
        Self::observer(partition_id, boxed)
    }

    /// Lease lost for the given partition.
    pub fn lease_lost(partition_id: &PartitionId) -> Self {
        FeedError::LeaseLost {
            partition_id: partition_id.clone(),
        }
    }

    /// Check if this error means the lease is owned by someone else.
    #[inline]
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, FeedError::LeaseLost { .. })
    }

    /// Check if this error came from consumer code.
    #[inline]
    pub fn is_observer_error(&self) -> bool {
        matches!(self, FeedError::Observer { .. })
    }

    /// Check if this error is a cancellation.
    #[inline]
    pub fn is_canceled(&self) -> bool {
        matches!(self, FeedError::Canceled)
    }

    /// Check if this error signals a split.
    #[inline]
    pub fn is_split(&self) -> bool {
        matches!(self, FeedError::PartitionSplit { .. })
    }

    /// Check if this is a throttling or server-side store failure.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::Store(e) if e.is_transient())
    }

    /// Underlying store error kind, if this is a store error.
    pub fn store_kind(&self) -> Option<StoreErrorKind> {
        match self {
            FeedError::Store(e) => Some(e.kind()),
            _ => None,
        }
    }

    /// Continuation carried by not-found and split signals.
    pub fn last_continuation(&self) -> Option<&str> {
        match self {
            FeedError::PartitionNotFound {
                last_continuation, ..
            }
            | FeedError::PartitionSplit {
                last_continuation, ..
            } => last_continuation.as_deref(),
            _ => None,
        }
    }

    /// The observer close reason this error maps to when it ends processing.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            FeedError::LeaseLost { .. } => CloseReason::LeaseLost,
            FeedError::PartitionSplit { .. } => CloseReason::LeaseGone,
            FeedError::PartitionNotFound { .. } => CloseReason::ResourceGone,
            FeedError::Observer { .. } => CloseReason::ObserverError,
            FeedError::Canceled => CloseReason::Shutdown,
            FeedError::Store(e) if e.kind() == StoreErrorKind::ReadSessionNotAvailable => {
                CloseReason::ReadSessionNotAvailable
            }
            _ => CloseReason::Unknown,
        }
    }

    /// Returns a string label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            FeedError::Store(_) => "store",
            FeedError::PartitionNotFound { .. } => "partition_not_found",
            FeedError::PartitionSplit { .. } => "partition_split",
            FeedError::LeaseLost { .. } => "lease_lost",
            FeedError::Observer { .. } => "observer",
            FeedError::InvalidOperation(_) => "invalid_operation",
            FeedError::Config(_) => "config",
            FeedError::Canceled => "canceled",
        }
    }
}
