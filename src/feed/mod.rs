//! Lease-coordinated change feed processing.
//!
//! # Architecture
//!
//! ```text
//!                       ┌────────────────────┐
//!                       │   ChangeFeedHost   │
//!                       └─────────┬──────────┘
//!        ┌────────────────────────┼──────────────────────────┐
//!        ▼                        ▼                          ▼
//! ┌──────────────┐      ┌───────────────────┐       ┌─────────────────┐
//! │ Bootstrapper │      │ LoadBalancer      │       │ Estimator       │
//! │  └ Synchron. │      │  └ Controller     │       │ (monitoring)    │
//! └──────────────┘      │     (health,      │       └─────────────────┘
//!                       │      escalation)  │
//!                       └─────────┬─────────┘
//!                                 ▼  one per owned partition
//!                       ┌───────────────────┐
//!                       │ Supervisor        │
//!                       │  ├ Processor ───────▶ Observer (checkpointing)
//!                       │  └ LeaseRenewer   │
//!                       └───────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`traits`]: collaborator seams (source, lease manager, stores)
//! - [`bootstrapper`] and [`synchronizer`]: one-time lease store setup, lease reconciliation and splits
//! - [`partition_processor`]: the per-partition read/dispatch loop
//! - [`checkpointing`]: observer decorators and automatic checkpoints
//! - [`controller`], [`balancer`]: ownership of partitions
//! - [`health`] and [`unhealthiness`]: reporting and escalation around acquisition
//! - [`estimator`]: remaining-work estimation
//! - [`metrics`], [`observability`]: Prometheus metrics and tracing spans

pub mod balancer;
pub mod bootstrapper;
pub mod checkpointer;
pub mod checkpointing;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod error;
pub mod estimator;
pub mod health;
pub mod host;
pub mod lease;
pub mod lease_renewer;
pub mod lease_store;
pub mod metrics;
pub mod observability;
pub mod observer;
pub mod partition_processor;
pub mod retry;
pub mod settings;
pub mod supervisor;
pub mod synchronizer;
pub mod traits;
pub mod unhealthiness;

#[cfg(any(test, feature = "test-utilities"))]
pub mod memory;

pub use balancer::{EqualPartitionsBalancingStrategy, PartitionLoadBalancer};
pub use bootstrapper::Bootstrapper;
pub use checkpointer::PartitionCheckpointer;
pub use checkpointing::{AutoCheckpointer, CheckpointerObserverFactory, ObserverExceptionWrapping};
pub use classifier::{ErrorClass, classify};
pub use config::{CheckpointFrequency, ProcessorConfig};
pub use controller::{PartitionController, PartitionControllerCore};
pub use error::{BoxError, FeedError, FeedResult};
pub use estimator::RemainingWorkEstimator;
pub use health::{
    HealthMonitor, HealthMonitoringPartitionController, HealthMonitoringRecord, HealthSeverity,
    MonitoredOperation, TracingHealthMonitor,
};
pub use host::{ChangeFeedHost, ChangeFeedHostBuilder};
pub use lease::Lease;
pub use lease_renewer::LeaseRenewer;
pub use lease_store::DocumentLeaseStore;
pub use observer::{ChangeFeedObserver, CloseReason, ObserverContext, ObserverFactory};
pub use partition_processor::PartitionProcessor;
pub use settings::ProcessorSettings;
pub use supervisor::PartitionSupervisor;
pub use synchronizer::{PartitionSynchronizer, SourcePartitionSynchronizer};
pub use traits::{
    ChangeFeedPage, ChangeFeedRequest, ChangeFeedSource, DocumentStore, LeaseManager, LeaseStore,
    PartitionPage,
};
pub use unhealthiness::{AbortProcess, SustainedUnhealthinessController, UnhealthinessStrategy};

#[cfg(any(test, feature = "test-utilities"))]
pub use unhealthiness::RecordingStrategy;
