//! Runs the processor and the lease renewer of one partition together.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::{FeedError, FeedResult};
use super::lease_renewer::LeaseRenewer;
use super::observer::{ChangeFeedObserver, CloseReason, ObserverContext};
use super::partition_processor::PartitionProcessor;
use crate::types::PartitionId;

/// Owns the observer lifecycle of one partition.
///
/// Opens the observer, runs processor and renewer until either ends (which
/// stops the other), then closes the observer with the matching
/// [`CloseReason`].
pub struct PartitionSupervisor {
    partition_id: PartitionId,
    observer: Arc<dyn ChangeFeedObserver>,
    processor: PartitionProcessor,
    renewer: LeaseRenewer,
}

impl PartitionSupervisor {
    pub fn new(
        partition_id: PartitionId,
        observer: Arc<dyn ChangeFeedObserver>,
        processor: PartitionProcessor,
        renewer: LeaseRenewer,
    ) -> Self {
        Self {
            partition_id,
            observer,
            processor,
            renewer,
        }
    }

    /// Run until `shutdown` fires (`Ok`) or processing fails (`Err`).
    pub async fn run(self, shutdown: &CancellationToken) -> FeedResult<()> {
        let Self {
            partition_id,
            observer,
            processor,
            renewer,
        } = self;
        let context = ObserverContext::new(partition_id.clone());

        observer
            .open(&context)
            .await
            .map_err(|e| FeedError::observer(&partition_id, e))?;

        let linked = shutdown.child_token();
        let (processed, renewed) = tokio::join!(
            async {
                let result = processor.run(&linked).await;
                linked.cancel();
                result
            },
            async {
                let result = renewer.run(&linked).await;
                linked.cancel();
                result
            },
        );
        let result = first_failure(processed, renewed);

        let reason = if shutdown.is_cancelled() {
            CloseReason::Shutdown
        } else {
            match &result {
                Err(e) => e.close_reason(),
                Ok(()) => CloseReason::Unknown,
            }
        };
        info!(partition_id = %partition_id, reason = %reason, "Closing observer");
        if let Err(e) = observer.close(&context, reason).await {
            warn!(partition_id = %partition_id, error = %e, "Observer failed to close");
        }

        match result {
            Err(e) if e.is_canceled() && shutdown.is_cancelled() => Ok(()),
            other => other,
        }
    }
}

/// The failure that ended the pair; cancellation only when nothing else failed.
fn first_failure(processor: FeedResult<()>, renewer: FeedResult<()>) -> FeedResult<()> {
    match (processor, renewer) {
        (Err(e), _) if !e.is_canceled() => Err(e),
        (_, Err(e)) if !e.is_canceled() => Err(e),
        (Err(e), _) | (_, Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}
