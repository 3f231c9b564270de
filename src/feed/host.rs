//! The processor host: wires every component together.
//!
//! # Lifecycle
//!
//! ```text
//! start: bootstrap lease store ──▶ resume owned leases ──▶ spawn load balancer
//! stop:  cancel load balancer ──▶ shut down controller (observers closed, leases released)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use leasefeed::prelude::*;
//! # async fn run(
//! #     source: Arc<dyn ChangeFeedSource>,
//! #     leases: Arc<dyn LeaseManager>,
//! #     lease_store: Arc<dyn LeaseStore>,
//! #     factory: Arc<dyn ObserverFactory>,
//! # ) -> Result<(), FeedError> {
//! let host = ChangeFeedHost::builder(ProcessorConfig::from_env()?)
//!     .source(source)
//!     .lease_manager(leases)
//!     .lease_store(lease_store)
//!     .observer_factory(factory)
//!     .build()?;
//!
//! host.start().await?;
//! tokio::signal::ctrl_c().await.ok();
//! host.stop().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::balancer::{EqualPartitionsBalancingStrategy, PartitionLoadBalancer};
use super::bootstrapper::Bootstrapper;
use super::checkpointing::CheckpointerObserverFactory;
use super::config::ProcessorConfig;
use super::controller::{PartitionController, PartitionControllerCore};
use super::error::{FeedError, FeedResult};
use super::estimator::RemainingWorkEstimator;
use super::health::{HealthMonitor, HealthMonitoringPartitionController, TracingHealthMonitor};
use super::metrics;
use super::observer::ObserverFactory;
use super::synchronizer::{PartitionSynchronizer, SourcePartitionSynchronizer};
use super::traits::{ChangeFeedSource, LeaseManager, LeaseStore};
use super::unhealthiness::{AbortProcess, SustainedUnhealthinessController, UnhealthinessStrategy};
use crate::types::RemainingPartitionWork;

/// Builder for [`ChangeFeedHost`].
pub struct ChangeFeedHostBuilder {
    config: ProcessorConfig,
    source: Option<Arc<dyn ChangeFeedSource>>,
    lease_manager: Option<Arc<dyn LeaseManager>>,
    lease_store: Option<Arc<dyn LeaseStore>>,
    observer_factory: Option<Arc<dyn ObserverFactory>>,
    health_monitor: Arc<dyn HealthMonitor>,
    unhealthiness_strategy: Arc<dyn UnhealthinessStrategy>,
}

impl ChangeFeedHostBuilder {
    fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            source: None,
            lease_manager: None,
            lease_store: None,
            observer_factory: None,
            health_monitor: Arc::new(TracingHealthMonitor),
            unhealthiness_strategy: Arc::new(AbortProcess),
        }
    }

    /// Set the monitored change feed.
    pub fn source(mut self, source: Arc<dyn ChangeFeedSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the lease manager shared by all hosts.
    pub fn lease_manager(mut self, lease_manager: Arc<dyn LeaseManager>) -> Self {
        self.lease_manager = Some(lease_manager);
        self
    }

    /// Set the lease store used for bootstrap.
    pub fn lease_store(mut self, lease_store: Arc<dyn LeaseStore>) -> Self {
        self.lease_store = Some(lease_store);
        self
    }

    /// Set the factory of consumer observers.
    pub fn observer_factory(mut self, factory: Arc<dyn ObserverFactory>) -> Self {
        self.observer_factory = Some(factory);
        self
    }

    /// Replace the default [`TracingHealthMonitor`].
    pub fn health_monitor(mut self, monitor: Arc<dyn HealthMonitor>) -> Self {
        self.health_monitor = monitor;
        self
    }

    /// Replace the default [`AbortProcess`] strategy.
    pub fn unhealthiness_strategy(mut self, strategy: Arc<dyn UnhealthinessStrategy>) -> Self {
        self.unhealthiness_strategy = strategy;
        self
    }

    /// Validate the configuration and assemble the host.
    pub fn build(self) -> FeedResult<ChangeFeedHost> {
        let config = Arc::new(self.config.validated()?);
        let source = self
            .source
            .ok_or_else(|| FeedError::Config("source is required".to_string()))?;
        let lease_manager = self
            .lease_manager
            .ok_or_else(|| FeedError::Config("lease_manager is required".to_string()))?;
        let lease_store = self
            .lease_store
            .ok_or_else(|| FeedError::Config("lease_store is required".to_string()))?;
        let observer_factory = self
            .observer_factory
            .ok_or_else(|| FeedError::Config("observer_factory is required".to_string()))?;

        metrics::init_metrics();

        let synchronizer: Arc<dyn PartitionSynchronizer> = Arc::new(SourcePartitionSynchronizer::new(
            source.clone(),
            lease_manager.clone(),
            config.degree_of_parallelism,
            config.query_partitions_max_batch_size,
        ));
        let bootstrapper = Bootstrapper::new(
            synchronizer.clone(),
            lease_store,
            config.bootstrap_lock_time,
            config.bootstrap_sleep_time,
        )?;

        let observer_factory: Arc<dyn ObserverFactory> = Arc::new(CheckpointerObserverFactory::new(
            observer_factory,
            config.checkpoint_frequency.clone(),
        ));
        let core: Arc<dyn PartitionController> = Arc::new(PartitionControllerCore::new(
            config.clone(),
            source.clone(),
            lease_manager.clone(),
            synchronizer,
            observer_factory,
        ));
        let monitored: Arc<dyn PartitionController> =
            Arc::new(HealthMonitoringPartitionController::new(core, self.health_monitor));
        let controller: Arc<dyn PartitionController> = Arc::new(SustainedUnhealthinessController::new(
            monitored,
            self.unhealthiness_strategy,
            config.unhealthiness_threshold(),
        ));

        let balancer = Arc::new(PartitionLoadBalancer::new(
            controller.clone(),
            lease_manager.clone(),
            EqualPartitionsBalancingStrategy::new(
                config.host_name.clone(),
                config.min_partition_count,
                config.max_partition_count,
                config.lease_expiration_interval,
            ),
            config.lease_acquire_interval,
        ));
        let estimator =
            RemainingWorkEstimator::new(lease_manager, source, config.degree_of_parallelism);

        Ok(ChangeFeedHost {
            config,
            bootstrapper,
            controller,
            balancer,
            estimator,
            state: Mutex::new(HostState::Created),
        })
    }
}

enum HostState {
    Created,
    Running {
        cancel: CancellationToken,
        balancer: JoinHandle<()>,
    },
    Stopped,
}

/// A change feed processor host.
pub struct ChangeFeedHost {
    config: Arc<ProcessorConfig>,
    bootstrapper: Bootstrapper,
    controller: Arc<dyn PartitionController>,
    balancer: Arc<PartitionLoadBalancer>,
    estimator: RemainingWorkEstimator,
    state: Mutex<HostState>,
}

impl ChangeFeedHost {
    pub fn builder(config: ProcessorConfig) -> ChangeFeedHostBuilder {
        ChangeFeedHostBuilder::new(config)
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Bootstrap, resume owned leases and start balancing.
    ///
    /// A host starts once; starting it again fails with
    /// [`FeedError::InvalidOperation`].
    pub async fn start(&self) -> FeedResult<()> {
        let mut state = self.state.lock().await;
        if !matches!(*state, HostState::Created) {
            return Err(FeedError::InvalidOperation(
                "host was already started".to_string(),
            ));
        }

        info!(host = %self.config.host_name, "Starting change feed host");
        self.bootstrapper.initialize().await?;
        self.controller.initialize().await?;

        let cancel = CancellationToken::new();
        let balancer = tokio::spawn({
            let balancer = self.balancer.clone();
            let cancel = cancel.clone();
            async move { balancer.run(&cancel).await }
        });
        *state = HostState::Running { cancel, balancer };
        info!(host = %self.config.host_name, "Change feed host started");
        Ok(())
    }

    /// Stop balancing and processing. Does nothing unless running.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let HostState::Running { cancel, balancer } =
            std::mem::replace(&mut *state, HostState::Stopped)
        else {
            return;
        };

        info!(host = %self.config.host_name, "Stopping change feed host");
        cancel.cancel();
        if let Err(e) = balancer.await {
            warn!(error = %e, "Load balancer task failed");
        }
        self.controller.shutdown().await;
        info!(host = %self.config.host_name, "Change feed host stopped");
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, HostState::Running { .. })
    }

    /// Total estimated remaining work across all leases.
    pub async fn estimated_remaining_work(&self) -> FeedResult<u64> {
        self.estimator.estimated_remaining_work().await
    }

    /// Estimated remaining work per partition.
    pub async fn estimated_partitions_remaining_work(
        &self,
    ) -> FeedResult<Vec<RemainingPartitionWork>> {
        self.estimator.estimated_partitions_remaining_work().await
    }
}
