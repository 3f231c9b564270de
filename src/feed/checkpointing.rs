//! Observer decorators: consumer error wrapping and automatic checkpoints.
//!
//! [`CheckpointerObserverFactory`] builds the chain once per partition:
//!
//! ```text
//! explicit:   ObserverExceptionWrapping(consumer)
//! automatic:  AutoCheckpointer(ObserverExceptionWrapping(consumer))
//! ```
//!
//! Every decorator implements [`ChangeFeedObserver`] itself, so the processor
//! never knows which strategy is in use.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::config::CheckpointFrequency;
use super::error::{BoxError, FeedError};
use super::observer::{ChangeFeedObserver, CloseReason, ObserverContext, ObserverFactory};
use crate::types::Document;

fn wrap(context: &ObserverContext, error: BoxError) -> BoxError {
    Box::new(FeedError::observer(context.partition_id(), error))
}

fn wrap_delivery(context: &ObserverContext, error: BoxError, cancel: &CancellationToken) -> BoxError {
    Box::new(FeedError::delivery(context.partition_id(), error, cancel))
}

/// Marks every consumer failure as an observer error.
pub struct ObserverExceptionWrapping {
    inner: Arc<dyn ChangeFeedObserver>,
}

impl ObserverExceptionWrapping {
    pub fn new(inner: Arc<dyn ChangeFeedObserver>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ChangeFeedObserver for ObserverExceptionWrapping {
    async fn open(&self, context: &ObserverContext) -> Result<(), BoxError> {
        self.inner.open(context).await.map_err(|e| wrap(context, e))
    }

    async fn close(&self, context: &ObserverContext, reason: CloseReason) -> Result<(), BoxError> {
        self.inner
            .close(context, reason)
            .await
            .map_err(|e| wrap(context, e))
    }

    async fn process_changes(
        &self,
        context: &ObserverContext,
        changes: Vec<Document>,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        self.inner
            .process_changes(context, changes, cancel)
            .await
            .map_err(|e| wrap_delivery(context, e, cancel))
    }
}

#[derive(Debug)]
struct CheckpointState {
    processed: usize,
    last_checkpoint: Instant,
}

/// Checkpoints after deliveries once a document-count or time threshold is met.
///
/// With neither threshold configured it checkpoints after every delivery. A
/// failed delivery skips the checkpoint and leaves the counters untouched.
pub struct AutoCheckpointer {
    inner: Arc<dyn ChangeFeedObserver>,
    frequency: CheckpointFrequency,
    state: Mutex<CheckpointState>,
}

impl AutoCheckpointer {
    pub fn new(frequency: CheckpointFrequency, inner: Arc<dyn ChangeFeedObserver>) -> Self {
        Self {
            inner,
            frequency,
            state: Mutex::new(CheckpointState {
                processed: 0,
                last_checkpoint: Instant::now(),
            }),
        }
    }

    /// Documents delivered since the last checkpoint.
    pub fn processed_count(&self) -> usize {
        self.state.lock().map(|s| s.processed).unwrap_or(0)
    }

    fn record_and_check(&self, delivered: usize) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return true;
        };
        state.processed += delivered;
        let by_count = self.frequency.processed_document_count;
        let by_time = self.frequency.time_interval;
        if by_count.is_none() && by_time.is_none() {
            return true;
        }
        by_count.is_some_and(|n| state.processed >= n)
            || by_time.is_some_and(|t| state.last_checkpoint.elapsed() >= t)
    }

    fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.processed = 0;
            state.last_checkpoint = Instant::now();
        }
    }
}

#[async_trait]
impl ChangeFeedObserver for AutoCheckpointer {
    async fn open(&self, context: &ObserverContext) -> Result<(), BoxError> {
        self.inner.open(context).await
    }

    async fn close(&self, context: &ObserverContext, reason: CloseReason) -> Result<(), BoxError> {
        self.inner.close(context, reason).await
    }

    async fn process_changes(
        &self,
        context: &ObserverContext,
        changes: Vec<Document>,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let delivered = changes.len();
        self.inner
            .process_changes(context, changes, cancel)
            .await
            .map_err(|e| wrap_delivery(context, e, cancel))?;

        // Checkpoint failures are store failures, not consumer failures.
        if self.record_and_check(delivered) {
            context.checkpoint().await?;
            debug!(
                partition_id = %context.partition_id(),
                delivered,
                "Automatic checkpoint"
            );
            self.reset();
        }
        Ok(())
    }
}

/// Builds the decorated observer for each partition.
pub struct CheckpointerObserverFactory {
    inner: Arc<dyn ObserverFactory>,
    frequency: CheckpointFrequency,
}

impl CheckpointerObserverFactory {
    pub fn new(inner: Arc<dyn ObserverFactory>, frequency: CheckpointFrequency) -> Self {
        Self { inner, frequency }
    }
}

impl ObserverFactory for CheckpointerObserverFactory {
    fn create_observer(&self) -> Arc<dyn ChangeFeedObserver> {
        let wrapped: Arc<dyn ChangeFeedObserver> =
            Arc::new(ObserverExceptionWrapping::new(self.inner.create_observer()));
        if self.frequency.explicit_checkpoint {
            wrapped
        } else {
            Arc::new(AutoCheckpointer::new(self.frequency.clone(), wrapped))
        }
    }
}
