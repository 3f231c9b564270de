//! The per-partition read/dispatch loop.
//!
//! ```text
//! loop until canceled:
//!     drain: read page ─▶ dispatch if non-empty ─▶ repeat while more results
//!     on store failure, by class:
//!         not found / split ─▶ stop with a typed signal and the last continuation
//!         transient          ─▶ keep going (retry-after overrides the poll delay)
//!         page too large     ─▶ shrink the page size, retry immediately
//!         canceled           ─▶ stop if we asked for it, else transient
//!         undefined          ─▶ stop with the store error
//!     sleep the poll delay
//! ```
//!
//! The loop never reads ahead of the observer: each page is dispatched and
//! awaited before the next read.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::checkpointer::PartitionCheckpointer;
use super::classifier::{ErrorClass, classify};
use super::error::{FeedError, FeedResult};
use super::metrics;
use super::observer::{ChangeFeedObserver, ObserverContext};
use super::settings::ProcessorSettings;
use super::traits::{ChangeFeedPage, ChangeFeedRequest, ChangeFeedSource};
use crate::constants::{DEFAULT_MAX_ITEM_COUNT, MIN_MAX_ITEM_COUNT};
use crate::error::StoreError;
use crate::types::StartPosition;

/// Mutable read position of one processor.
#[derive(Debug)]
struct ReadState {
    start: StartPosition,
    last_continuation: Option<String>,
    page_size: Option<u32>,
}

/// Reads one partition and feeds its observer.
pub struct PartitionProcessor {
    source: Arc<dyn ChangeFeedSource>,
    observer: Arc<dyn ChangeFeedObserver>,
    checkpointer: Arc<PartitionCheckpointer>,
    settings: ProcessorSettings,
}

impl PartitionProcessor {
    pub fn new(
        source: Arc<dyn ChangeFeedSource>,
        observer: Arc<dyn ChangeFeedObserver>,
        checkpointer: Arc<PartitionCheckpointer>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            source,
            observer,
            checkpointer,
            settings,
        }
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    /// Run until `cancel` fires or a fatal condition occurs.
    ///
    /// Never returns `Ok`: cancellation surfaces as [`FeedError::Canceled`].
    pub async fn run(&self, cancel: &CancellationToken) -> FeedResult<()> {
        let mut state = ReadState {
            start: self.settings.start.clone(),
            last_continuation: self.settings.start.continuation().map(str::to_string),
            page_size: self.settings.max_item_count,
        };

        while !cancel.is_cancelled() {
            let mut delay = self.settings.feed_poll_delay;

            match self.drain(&mut state, cancel).await {
                Ok(()) => state.page_size = self.settings.max_item_count,
                Err(DrainError::Read(e)) => match self.on_store_error(e, &mut state, cancel)? {
                    Recovery::RetryNow => continue,
                    Recovery::RetryAfter(Some(retry_after)) => delay = retry_after,
                    Recovery::RetryAfter(None) => {}
                },
                Err(DrainError::Dispatch(e)) => return Err(e),
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Err(FeedError::Canceled)
    }

    fn on_store_error(
        &self,
        error: StoreError,
        state: &mut ReadState,
        cancel: &CancellationToken,
    ) -> FeedResult<Recovery> {
        let partition_id = &self.settings.partition_id;
        let class = classify(&error);
        metrics::record_processor_error(class.as_metric_label());

        match class {
            ErrorClass::PartitionNotFound => {
                warn!(partition_id = %partition_id, error = %error, "Partition not found");
                Err(FeedError::PartitionNotFound {
                    partition_id: partition_id.clone(),
                    last_continuation: state.last_continuation.clone(),
                })
            }
            ErrorClass::PartitionSplit => {
                debug!(partition_id = %partition_id, error = %error, "Partition split");
                Err(FeedError::PartitionSplit {
                    partition_id: partition_id.clone(),
                    last_continuation: state.last_continuation.clone(),
                })
            }
            ErrorClass::Undefined => Err(error.into()),
            ErrorClass::Transient => {
                warn!(
                    partition_id = %partition_id,
                    error = %error,
                    retry_after = ?error.retry_after(),
                    "Transient store failure, will retry"
                );
                Ok(Recovery::RetryAfter(error.retry_after()))
            }
            ErrorClass::PageTooLarge => {
                state.page_size = match state.page_size {
                    None => Some(DEFAULT_MAX_ITEM_COUNT / 2),
                    Some(size) if size <= MIN_MAX_ITEM_COUNT => return Err(error.into()),
                    Some(size) => Some(size / 2),
                };
                metrics::PAGE_SIZE_DEGRADATIONS.inc();
                warn!(
                    partition_id = %partition_id,
                    page_size = ?state.page_size,
                    "Page too large, reducing page size"
                );
                Ok(Recovery::RetryNow)
            }
            ErrorClass::Canceled => {
                if cancel.is_cancelled() {
                    return Err(FeedError::Canceled);
                }
                warn!(
                    partition_id = %partition_id,
                    error = %error,
                    "Store client canceled a read on its own, will retry"
                );
                Ok(Recovery::RetryAfter(None))
            }
        }
    }

    async fn drain(
        &self,
        state: &mut ReadState,
        cancel: &CancellationToken,
    ) -> Result<(), DrainError> {
        loop {
            let request = ChangeFeedRequest {
                partition_id: self.settings.partition_id.clone(),
                start: state.start.clone(),
                max_item_count: state.page_size,
            };
            let page = self
                .source
                .read_changes(&request, cancel)
                .await
                .map_err(DrainError::Read)?;
            metrics::record_page(self.settings.partition_id.as_str(), page.len());

            state.last_continuation = Some(page.continuation.clone());
            state.start = StartPosition::Continuation(page.continuation.clone());
            let has_more = page.has_more_results;

            if !page.is_empty() {
                self.dispatch(page, cancel)
                    .await
                    .map_err(DrainError::Dispatch)?;
            }
            if !has_more || cancel.is_cancelled() {
                return Ok(());
            }
        }
    }

    async fn dispatch(&self, page: ChangeFeedPage, cancel: &CancellationToken) -> FeedResult<()> {
        let partition_id = &self.settings.partition_id;
        let documents = page.documents.clone();
        let context =
            ObserverContext::for_page(partition_id.clone(), Arc::new(page), self.checkpointer.clone());

        let started = Instant::now();
        let result = self
            .observer
            .process_changes(&context, documents, cancel)
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                metrics::record_observer_call("ok", elapsed);
                Ok(())
            }
            Err(e) => {
                metrics::record_observer_call("error", elapsed);
                Err(FeedError::delivery(partition_id, e, cancel))
            }
        }
    }
}

/// Why a drain stopped early. Only read failures go through classification.
enum DrainError {
    Read(StoreError),
    Dispatch(FeedError),
}

enum Recovery {
    /// Read again without sleeping.
    RetryNow,
    /// Sleep, using the given delay instead of the poll delay when present.
    RetryAfter(Option<Duration>),
}
