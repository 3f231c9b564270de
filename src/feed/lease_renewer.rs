//! Periodic renewal of one owned lease.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{FeedError, FeedResult};
use super::lease::Lease;
use super::metrics;
use super::traits::LeaseManager;

/// Keeps one lease alive while its partition is processed.
///
/// Waits half an interval before the first renewal, then renews every
/// interval. Losing the lease ends the renewer; any other failure is logged
/// and retried at the next interval.
pub struct LeaseRenewer {
    lease_manager: Arc<dyn LeaseManager>,
    lease: Lease,
    interval: Duration,
}

impl LeaseRenewer {
    pub fn new(lease_manager: Arc<dyn LeaseManager>, lease: Lease, interval: Duration) -> Self {
        Self {
            lease_manager,
            lease,
            interval,
        }
    }

    /// Renew until `cancel` fires ([`FeedError::Canceled`]) or the lease is lost.
    pub async fn run(mut self, cancel: &CancellationToken) -> FeedResult<()> {
        let mut wait = self.interval / 2;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FeedError::Canceled),
                _ = tokio::time::sleep(wait) => {}
            }
            wait = self.interval;

            match self.lease_manager.renew(&self.lease).await {
                Ok(renewed) => {
                    metrics::record_lease_operation("renew", "success");
                    debug!(partition_id = %renewed.partition_id, "Lease renewed");
                    self.lease = renewed;
                }
                Err(e) if e.is_lease_lost() => {
                    metrics::record_lease_operation("renew", "lost");
                    warn!(partition_id = %self.lease.partition_id, "Lease lost during renewal");
                    return Err(e);
                }
                Err(e) => {
                    metrics::record_lease_operation("renew", "error");
                    warn!(
                        partition_id = %self.lease.partition_id,
                        error = %e,
                        "Lease renewal failed, will retry"
                    );
                }
            }
        }
    }
}
