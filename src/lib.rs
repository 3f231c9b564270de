//! # Leasefeed
//! Lease-coordinated, checkpointed consumption of a partitioned change feed.
//!
//! Many host processes share one change feed. Each partition of the feed is
//! owned by exactly one host at a time through a lease; hosts rebalance
//! partitions among themselves as hosts come and go and as partitions split,
//! and every host records its progress on the lease so that a restart or a
//! change of owner resumes from the last checkpoint.
//!
//! The crate talks to the outside world only through the traits in
//! [`feed::traits`]: a [`ChangeFeedSource`](feed::ChangeFeedSource) for
//! topology and change pages, a [`LeaseManager`](feed::LeaseManager) for
//! lease records and a [`LeaseStore`](feed::LeaseStore) for one-time
//! bootstrap. Consumer code implements
//! [`ChangeFeedObserver`](feed::ChangeFeedObserver).
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use leasefeed::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl ChangeFeedObserver for Printer {
//!     async fn process_changes(
//!         &self,
//!         context: &ObserverContext,
//!         changes: Vec<Document>,
//!         _cancel: &CancellationToken,
//!     ) -> Result<(), BoxError> {
//!         println!("{}: {} changes", context.partition_id(), changes.len());
//!         Ok(())
//!     }
//! }
//!
//! # async fn run(
//! #     source: Arc<dyn ChangeFeedSource>,
//! #     leases: Arc<dyn LeaseManager>,
//! #     lease_store: Arc<dyn LeaseStore>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let factory = || -> Arc<dyn ChangeFeedObserver> { Arc::new(Printer) };
//! let host = ChangeFeedHost::builder(ProcessorConfig::from_env()?)
//!     .source(source)
//!     .lease_manager(leases)
//!     .lease_store(lease_store)
//!     .observer_factory(Arc::new(factory))
//!     .build()?;
//! host.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! See `demos/host.rs` for two hosts sharing an in-memory feed.

#![forbid(unsafe_code)]

pub mod constants;
pub mod error;
pub mod feed;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Everything needed to run a host and write an observer.
    pub use crate::error::{StoreError, StoreErrorKind};
    pub use crate::feed::{
        BoxError, ChangeFeedHost, ChangeFeedObserver, ChangeFeedPage, ChangeFeedRequest,
        ChangeFeedSource, CheckpointFrequency, CloseReason, DocumentLeaseStore, DocumentStore,
        FeedError, FeedResult, Lease, LeaseManager, LeaseStore, ObserverContext, ObserverFactory,
        PartitionPage, ProcessorConfig,
    };
    pub use crate::types::{
        Document, PartitionId, PartitionRange, RemainingPartitionWork, StartPosition,
    };
}
