//! Named retry policies for store calls outside the partition read loop.
//!
//! The read loop recovers from transient failures on its own (poll delay or
//! server-suggested retry-after). Everything else that talks to a store (topology
//! listing, lease creation) retries transient failures through these policies.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `topology_policy` | 100ms | 5s | 5 | Partition listing |
//! | `lease_policy` | 50ms | 2s | 5 | Lease creation |
//!
//! Only throttling and server errors are retried; every other failure surfaces
//! on the first attempt.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use super::error::FeedError;
use super::metrics;
use crate::error::StoreError;

/// Policy for partition topology listing.
pub fn topology_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(5)
        .with_jitter()
}

/// Policy for lease creation.
pub fn lease_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

/// Run a store call under `policy`, retrying transient store errors.
pub async fn retry_store<F, Fut, T>(
    policy_name: &'static str,
    policy: ExponentialBuilder,
    operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    operation
        .retry(policy)
        .when(StoreError::is_transient)
        .notify(|e, delay| {
            metrics::record_retry(policy_name);
            debug!(policy = policy_name, error = %e, ?delay, "Retrying store call");
        })
        .await
}

/// Run a feed operation under `policy`, retrying transient store errors.
pub async fn retry_feed<F, Fut, T>(
    policy_name: &'static str,
    policy: ExponentialBuilder,
    operation: F,
) -> Result<T, FeedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FeedError>>,
{
    operation
        .retry(policy)
        .when(FeedError::is_transient)
        .notify(|e, delay| {
            metrics::record_retry(policy_name);
            debug!(policy = policy_name, error = %e, ?delay, "Retrying lease call");
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_max_times(3)
    }

    #[tokio::test]
    async fn test_transient_store_errors_are_retried() {
        let attempts = AtomicU32::new(0);
        let result = retry_store("test", fast(), || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::throttled(Duration::from_millis(1)))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_store_errors_surface_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_store("test", fast(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::new(StoreErrorKind::Other, "bad request"))
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), StoreErrorKind::Other);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_feed_retry_stops_after_max_times() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), FeedError> = retry_feed("test", fast(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::new(StoreErrorKind::ServerError, "down").into())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_feed_retry_ignores_lease_lost() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), FeedError> = retry_feed("test", fast(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(FeedError::lease_lost(&crate::types::PartitionId::new("0")))
        })
        .await;
        assert!(result.unwrap_err().is_lease_lost());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
