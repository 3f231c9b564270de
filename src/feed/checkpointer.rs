//! Checkpoint writes for one owned partition.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::error::FeedResult;
use super::lease::Lease;
use super::metrics;
use super::traits::LeaseManager;
use crate::types::PartitionId;

/// Persists continuation tokens against the lease of one partition.
///
/// Holds the lease as last written by this host, so every checkpoint uses the
/// freshest version. A checkpoint after another host took the lease fails with
/// [`FeedError::LeaseLost`](super::FeedError::LeaseLost).
pub struct PartitionCheckpointer {
    lease_manager: Arc<dyn LeaseManager>,
    partition_id: PartitionId,
    lease: Mutex<Lease>,
}

impl PartitionCheckpointer {
    pub fn new(lease_manager: Arc<dyn LeaseManager>, lease: Lease) -> Self {
        Self {
            lease_manager,
            partition_id: lease.partition_id.clone(),
            lease: Mutex::new(lease),
        }
    }

    pub fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    /// Write `continuation_token` to the lease.
    pub async fn checkpoint_partition(&self, continuation_token: &str) -> FeedResult<()> {
        let mut lease = self.lease.lock().await;
        match self
            .lease_manager
            .checkpoint(&lease, continuation_token)
            .await
        {
            Ok(updated) => {
                *lease = updated;
                metrics::record_checkpoint("success");
                debug!(
                    partition_id = %self.partition_id,
                    continuation = continuation_token,
                    "Checkpoint written"
                );
                Ok(())
            }
            Err(e) => {
                metrics::record_checkpoint(e.as_metric_label());
                Err(e)
            }
        }
    }

    /// The lease as last written by this host.
    pub async fn lease(&self) -> Lease {
        self.lease.lock().await.clone()
    }
}
