//! Ownership of partitions on this host.
//!
//! The controller turns leases into running [`PartitionSupervisor`]s. One
//! supervisor runs per owned partition, each as its own task tracked by a
//! [`TaskTracker`] so that [`PartitionController::shutdown`] can wait for all
//! of them to close their observers and release their leases.
//!
//! ```text
//! add_or_update_lease(lease)
//!     │
//!     ├── already owned ──► update_properties
//!     │
//!     └── acquire ──► spawn supervisor ──► ... ──► ends
//!                                                   │
//!                         split? ──► split_partition ──► add children, delete parent
//!                                                   │
//!                                      remove from owned set, release lease
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, warn};

use super::checkpointer::PartitionCheckpointer;
use super::config::ProcessorConfig;
use super::error::{FeedError, FeedResult};
use super::lease::Lease;
use super::lease_renewer::LeaseRenewer;
use super::metrics;
use super::observability::{self, LeaseOperation};
use super::observer::ObserverFactory;
use super::partition_processor::PartitionProcessor;
use super::settings::ProcessorSettings;
use super::supervisor::PartitionSupervisor;
use super::synchronizer::PartitionSynchronizer;
use super::traits::{ChangeFeedSource, LeaseManager};
use crate::types::PartitionId;

/// Assigns leases to this host.
#[async_trait]
pub trait PartitionController: Send + Sync {
    /// Start processing the partition of `lease`, or refresh its properties
    /// when this host already processes it.
    async fn add_or_update_lease(&self, lease: Lease) -> FeedResult<()>;

    /// Resume processing of every lease this host already owns.
    async fn initialize(&self) -> FeedResult<()>;

    /// Stop every supervisor and wait for them to finish.
    async fn shutdown(&self);
}

/// The [`PartitionController`] that runs supervisors.
#[derive(Clone)]
pub struct PartitionControllerCore {
    config: Arc<ProcessorConfig>,
    source: Arc<dyn ChangeFeedSource>,
    lease_manager: Arc<dyn LeaseManager>,
    synchronizer: Arc<dyn PartitionSynchronizer>,
    observer_factory: Arc<dyn ObserverFactory>,
    owned: Arc<DashMap<PartitionId, CancellationToken>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl PartitionControllerCore {
    pub fn new(
        config: Arc<ProcessorConfig>,
        source: Arc<dyn ChangeFeedSource>,
        lease_manager: Arc<dyn LeaseManager>,
        synchronizer: Arc<dyn PartitionSynchronizer>,
        observer_factory: Arc<dyn ObserverFactory>,
    ) -> Self {
        Self {
            config,
            source,
            lease_manager,
            synchronizer,
            observer_factory,
            owned: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Partitions currently processed by this host.
    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        let mut owned: Vec<PartitionId> = self.owned.iter().map(|e| e.key().clone()).collect();
        owned.sort();
        owned
    }

    pub fn is_owned(&self, partition_id: &PartitionId) -> bool {
        self.owned.contains_key(partition_id)
    }

    fn publish_owned(&self) {
        metrics::OWNED_PARTITIONS.set(self.owned.len() as i64);
    }

    fn forget(&self, partition_id: &PartitionId) {
        self.owned.remove(partition_id);
        self.publish_owned();
    }

    async fn acquire(&self, lease: &Lease) -> FeedResult<Lease> {
        let span = observability::lease_operation_span(
            &lease.partition_id,
            self.lease_manager.host_name(),
            LeaseOperation::Acquire,
        );
        let result = self.lease_manager.acquire(lease).instrument(span.clone()).await;
        match &result {
            Ok(_) => {
                observability::record_success(&span);
                metrics::record_lease_operation("acquire", "success");
            }
            Err(e) => {
                observability::record_error(&span, e);
                metrics::record_lease_operation("acquire", "error");
            }
        }
        result
    }

    /// Run one partition to completion, then hand its lease back.
    async fn run_partition(self, lease: Lease, token: CancellationToken) {
        let partition_id = lease.partition_id.clone();
        let checkpointer = Arc::new(PartitionCheckpointer::new(
            self.lease_manager.clone(),
            lease.clone(),
        ));
        let observer = self.observer_factory.create_observer();
        let processor = PartitionProcessor::new(
            self.source.clone(),
            observer.clone(),
            checkpointer.clone(),
            ProcessorSettings::from_lease(&lease, &self.config),
        );
        let renewer = LeaseRenewer::new(
            self.lease_manager.clone(),
            lease.clone(),
            self.config.lease_renew_interval,
        );
        let supervisor = PartitionSupervisor::new(
            partition_id.clone(),
            observer,
            processor,
            renewer,
        );

        let span = observability::partition_processing_span(&partition_id, &self.config.host_name);
        let result = supervisor.run(&token).instrument(span.clone()).await;
        let mut latest = checkpointer.lease().await;

        match result {
            Ok(()) => {
                observability::record_success(&span);
                info!(partition_id = %partition_id, "Partition processing stopped");
            }
            Err(FeedError::PartitionSplit {
                last_continuation, ..
            }) => {
                observability::record_success(&span);
                if let Some(token) = last_continuation {
                    latest.continuation_token = Some(token);
                }
                if let Err(e) = self.handle_split(&latest).await {
                    warn!(partition_id = %partition_id, error = %e, "Failed to hand over split partition");
                }
            }
            Err(e) => {
                observability::record_error(&span, &e);
                warn!(partition_id = %partition_id, error = %e, "Partition processing failed");
            }
        }

        self.forget(&partition_id);
        match self.lease_manager.release(&latest).await {
            Ok(()) => {
                metrics::record_lease_operation("release", "success");
                debug!(partition_id = %partition_id, "Lease released");
            }
            Err(e) if e.is_lease_lost() => {
                metrics::record_lease_operation("release", "lost");
                debug!(partition_id = %partition_id, "Lease already lost on release");
            }
            Err(e) => {
                metrics::record_lease_operation("release", "error");
                warn!(partition_id = %partition_id, error = %e, "Failed to release lease");
            }
        }
    }

    /// Replace a split partition's lease by leases of its children.
    async fn handle_split(&self, parent: &Lease) -> FeedResult<()> {
        let span = observability::lease_operation_span(
            &parent.partition_id,
            self.lease_manager.host_name(),
            LeaseOperation::Split,
        );
        async {
            let children = self.synchronizer.split_partition(parent).await?;
            info!(
                partition_id = %parent.partition_id,
                children = children.len(),
                "Partition split, taking over children"
            );
            for mut child in children {
                child.properties = parent.properties.clone();
                let child_id = child.partition_id.clone();
                if let Err(e) = PartitionController::add_or_update_lease(self, child).await {
                    warn!(partition_id = %child_id, error = %e, "Failed to take child lease");
                }
            }
            self.lease_manager.delete(parent).await?;
            metrics::record_lease_operation("split", "success");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl PartitionController for PartitionControllerCore {
    async fn add_or_update_lease(&self, lease: Lease) -> FeedResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(FeedError::Canceled);
        }

        let token = match self.owned.entry(lease.partition_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let token = self.shutdown.child_token();
                slot.insert(token.clone());
                Some(token)
            }
        };

        let Some(token) = token else {
            self.lease_manager.update_properties(&lease).await?;
            debug!(partition_id = %lease.partition_id, "Updated properties of owned lease");
            return Ok(());
        };

        let acquired = match self.acquire(&lease).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.owned.remove(&lease.partition_id);
                return Err(e);
            }
        };
        self.publish_owned();
        info!(partition_id = %acquired.partition_id, "Partition acquired");

        let this = self.clone();
        self.tasks.spawn(this.run_partition(acquired, token));
        Ok(())
    }

    async fn initialize(&self) -> FeedResult<()> {
        let leases = self.lease_manager.list_owned_leases().await?;
        info!(count = leases.len(), "Resuming owned leases");
        for lease in leases {
            let partition_id = lease.partition_id.clone();
            if let Err(e) = self.add_or_update_lease(lease).await {
                warn!(partition_id = %partition_id, error = %e, "Failed to resume owned lease");
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Partition controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::{StoreError, StoreErrorKind};
    use crate::feed::checkpointing::CheckpointerObserverFactory;
    use crate::feed::config::CheckpointFrequency;
    use crate::feed::error::BoxError;
    use crate::feed::memory::{InMemoryChangeFeed, InMemoryLeaseManager, LeaseOp};
    use crate::feed::observer::{ChangeFeedObserver, ObserverContext};
    use crate::feed::synchronizer::SourcePartitionSynchronizer;
    use crate::types::{Document, StartPosition};

    struct Discard;

    #[async_trait]
    impl ChangeFeedObserver for Discard {
        async fn process_changes(
            &self,
            _context: &ObserverContext,
            _changes: Vec<Document>,
            _cancel: &CancellationToken,
        ) -> Result<(), BoxError> {
            Ok(())
        }
    }

    fn controller(feed: &InMemoryChangeFeed, manager: &InMemoryLeaseManager) -> PartitionControllerCore {
        let config = Arc::new(ProcessorConfig {
            host_name: "a".to_string(),
            start_position: StartPosition::Beginning,
            feed_poll_delay: Duration::from_millis(10),
            lease_renew_interval: Duration::from_millis(100),
            ..ProcessorConfig::default()
        });
        let source: Arc<dyn ChangeFeedSource> = Arc::new(feed.clone());
        let leases: Arc<dyn LeaseManager> = Arc::new(manager.clone());
        let synchronizer = Arc::new(SourcePartitionSynchronizer::new(
            source.clone(),
            leases.clone(),
            2,
            10,
        ));
        let factory = || -> Arc<dyn ChangeFeedObserver> { Arc::new(Discard) };
        let factory = CheckpointerObserverFactory::new(Arc::new(factory), CheckpointFrequency::every_batch());
        PartitionControllerCore::new(config, source, leases, synchronizer, Arc::new(factory))
    }

    async fn create(manager: &InMemoryLeaseManager, pid: &str) -> Lease {
        manager
            .create_lease_if_not_exists(&PartitionId::new(pid), None)
            .await
            .unwrap()
            .unwrap()
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_acquires_processes_and_releases_on_shutdown() {
        let feed = InMemoryChangeFeed::with_partitions(1).await;
        feed.append_many("0", 3).await.unwrap();
        let manager = InMemoryLeaseManager::new("a");
        let ctl = controller(&feed, &manager);

        ctl.add_or_update_lease(create(&manager, "0").await).await.unwrap();
        assert!(ctl.is_owned(&PartitionId::new("0")));
        assert_eq!(manager.get("0").await.unwrap().owner.as_deref(), Some("a"));

        eventually(|| async { manager.checkpoint_count() > 0 }).await;
        ctl.shutdown().await;

        let lease = manager.get("0").await.unwrap();
        assert!(lease.owner.is_none());
        assert_eq!(lease.continuation_token.as_deref(), Some("3"));
        assert!(ctl.owned_partitions().is_empty());
    }

    #[tokio::test]
    async fn test_owned_lease_only_updates_properties() {
        let feed = InMemoryChangeFeed::with_partitions(1).await;
        let manager = InMemoryLeaseManager::new("a");
        let ctl = controller(&feed, &manager);

        ctl.add_or_update_lease(create(&manager, "0").await).await.unwrap();
        let mut lease = manager.get("0").await.unwrap();
        lease.properties.insert("tier".to_string(), "gold".to_string());
        ctl.add_or_update_lease(lease).await.unwrap();

        let stored = manager.get("0").await.unwrap();
        assert_eq!(stored.properties.get("tier").map(String::as_str), Some("gold"));
        assert_eq!(ctl.owned_partitions(), vec![PartitionId::new("0")]);
        ctl.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_acquire_is_not_owned() {
        let feed = InMemoryChangeFeed::with_partitions(1).await;
        let manager = InMemoryLeaseManager::new("a");
        let ctl = controller(&feed, &manager);
        let lease = create(&manager, "0").await;
        manager
            .fail_next(LeaseOp::Acquire, StoreError::new(StoreErrorKind::Conflict, "raced"))
            .await;

        let err = ctl.add_or_update_lease(lease).await.unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::Conflict));
        assert!(!ctl.is_owned(&PartitionId::new("0")));
        ctl.shutdown().await;
    }

    #[tokio::test]
    async fn test_split_hands_over_to_children() {
        let feed = InMemoryChangeFeed::with_partitions(1).await;
        feed.append_many("0", 2).await.unwrap();
        let manager = InMemoryLeaseManager::new("a");
        let ctl = controller(&feed, &manager);

        let mut lease = create(&manager, "0").await;
        lease.properties.insert("tier".to_string(), "gold".to_string());
        ctl.add_or_update_lease(lease).await.unwrap();
        eventually(|| async { manager.checkpoint_count() > 0 }).await;

        feed.split("0", &["1", "2"]).await.unwrap();
        eventually(|| async {
            manager.get("0").await.is_none()
                && manager.get("1").await.is_some()
                && manager.get("2").await.is_some()
        })
        .await;

        for child in ["1", "2"] {
            let lease = manager.get(child).await.unwrap();
            assert_eq!(lease.owner.as_deref(), Some("a"));
            assert_eq!(lease.properties.get("tier").map(String::as_str), Some("gold"));
        }
        eventually(|| async {
            ctl.owned_partitions() == vec![PartitionId::new("1"), PartitionId::new("2")]
        })
        .await;
        ctl.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_resumes_owned_leases() {
        let feed = InMemoryChangeFeed::with_partitions(2).await;
        let manager = InMemoryLeaseManager::new("a");
        let mut mine = create(&manager, "0").await;
        mine.owner = Some("a".to_string());
        manager.insert(mine).await;
        create(&manager, "1").await;

        let ctl = controller(&feed, &manager);
        ctl.initialize().await.unwrap();
        assert_eq!(ctl.owned_partitions(), vec![PartitionId::new("0")]);
        ctl.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_after_shutdown_is_rejected() {
        let feed = InMemoryChangeFeed::with_partitions(1).await;
        let manager = InMemoryLeaseManager::new("a");
        let ctl = controller(&feed, &manager);
        ctl.shutdown().await;
        let err = ctl.add_or_update_lease(create(&manager, "0").await).await.unwrap_err();
        assert!(err.is_canceled());
    }
}
