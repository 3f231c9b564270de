//! Escalation of sustained acquisition failures.
//!
//! A host that keeps failing to take partitions for several lease expiration
//! intervals makes no progress while still looking alive. This decorator
//! turns that state into a call to an [`UnhealthinessStrategy`], which by
//! default aborts the process so that a supervisor replaces it.
//!
//! # State
//!
//! One process-wide timestamp (milliseconds since the decorator was built,
//! plus one) of the first failure since the last success. Zero means
//! "healthy". Any success resets it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{error, warn};

use super::controller::PartitionController;
use super::error::{FeedError, FeedResult};
use super::lease::Lease;
use super::metrics;

/// What to do once the host has been unhealthy for too long.
pub trait UnhealthinessStrategy: Send + Sync {
    /// Called with the failure that crossed the threshold, before it is returned.
    fn escalate(&self, unhealthy_for: Duration, error: &FeedError);
}

/// Abort the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortProcess;

impl UnhealthinessStrategy for AbortProcess {
    fn escalate(&self, unhealthy_for: Duration, error: &FeedError) {
        error!(
            unhealthy_for_secs = unhealthy_for.as_secs(),
            error = %error,
            "Unable to acquire partitions for too long, aborting"
        );
        std::process::abort();
    }
}

/// Strategy that only counts escalations.
#[cfg(any(test, feature = "test-utilities"))]
#[derive(Debug, Default)]
pub struct RecordingStrategy {
    escalations: AtomicU64,
}

#[cfg(any(test, feature = "test-utilities"))]
impl RecordingStrategy {
    pub fn escalations(&self) -> u64 {
        self.escalations.load(Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "test-utilities"))]
impl UnhealthinessStrategy for RecordingStrategy {
    fn escalate(&self, _unhealthy_for: Duration, _error: &FeedError) {
        self.escalations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Tracks how long the wrapped controller has failed to acquire leases.
pub struct SustainedUnhealthinessController {
    inner: Arc<dyn PartitionController>,
    strategy: Arc<dyn UnhealthinessStrategy>,
    threshold: Duration,
    base: Instant,
    /// Millis since `base` plus one of the first failure; 0 when healthy.
    first_failure_millis: AtomicU64,
}

impl SustainedUnhealthinessController {
    pub fn new(
        inner: Arc<dyn PartitionController>,
        strategy: Arc<dyn UnhealthinessStrategy>,
        threshold: Duration,
    ) -> Self {
        Self {
            inner,
            strategy,
            threshold,
            base: Instant::now(),
            first_failure_millis: AtomicU64::new(0),
        }
    }

    /// Whether a failure has been seen since the last success.
    pub fn is_unhealthy(&self) -> bool {
        self.first_failure_millis.load(Ordering::SeqCst) != 0
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.base.elapsed().as_millis())
            .unwrap_or(u64::MAX - 1)
            .saturating_add(1)
    }

    fn mark_healthy(&self) {
        self.first_failure_millis.store(0, Ordering::SeqCst);
    }

    /// Record a failure and return how long the host has been unhealthy.
    fn mark_unhealthy(&self) -> Duration {
        let now = self.now_millis();
        let first = match self.first_failure_millis.compare_exchange(
            0,
            now,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => now,
            Err(current) => current,
        };
        Duration::from_millis(now.saturating_sub(first))
    }
}

#[async_trait]
impl PartitionController for SustainedUnhealthinessController {
    async fn add_or_update_lease(&self, lease: Lease) -> FeedResult<()> {
        match self.inner.add_or_update_lease(lease).await {
            Ok(()) => {
                self.mark_healthy();
                Ok(())
            }
            // Shutdown is not a health signal.
            Err(e) if e.is_canceled() => Err(e),
            Err(e) => {
                let unhealthy_for = self.mark_unhealthy();
                if unhealthy_for > self.threshold {
                    metrics::UNHEALTHINESS_ESCALATIONS.inc();
                    warn!(
                        unhealthy_for_secs = unhealthy_for.as_secs(),
                        threshold_secs = self.threshold.as_secs(),
                        "Sustained unhealthiness, escalating"
                    );
                    self.strategy.escalate(unhealthy_for, &e);
                }
                Err(e)
            }
        }
    }

    async fn initialize(&self) -> FeedResult<()> {
        self.inner.initialize().await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}
