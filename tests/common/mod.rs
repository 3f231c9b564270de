//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use leasefeed::constants::LSN_PROPERTY_NAME;
use leasefeed::feed::RecordingStrategy;
use leasefeed::feed::memory::{InMemoryChangeFeed, InMemoryDocumentStore, InMemoryLeaseManager};
use leasefeed::prelude::*;

/// Observer that records the LSNs it receives, per partition.
#[derive(Default, Clone)]
pub struct Recorder {
    pub delivered: Arc<Mutex<BTreeMap<String, Vec<u64>>>>,
}

impl Recorder {
    pub async fn lsns(&self, partition: &str) -> Vec<u64> {
        self.delivered
            .lock()
            .await
            .get(partition)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn total(&self) -> usize {
        self.delivered.lock().await.values().map(Vec::len).sum()
    }

    pub fn factory(&self) -> Arc<dyn ObserverFactory> {
        let recorder = self.clone();
        Arc::new(move || -> Arc<dyn ChangeFeedObserver> { Arc::new(recorder.clone()) })
    }
}

#[async_trait]
impl ChangeFeedObserver for Recorder {
    async fn process_changes(
        &self,
        context: &ObserverContext,
        changes: Vec<Document>,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let mut delivered = self.delivered.lock().await;
        let entry = delivered
            .entry(context.partition_id().to_string())
            .or_default();
        for change in changes {
            if let Some(lsn) = change.get(LSN_PROPERTY_NAME).and_then(|v| v.as_u64()) {
                entry.push(lsn);
            }
        }
        Ok(())
    }
}

pub fn fast_config(host: &str) -> ProcessorConfig {
    ProcessorConfig {
        host_name: host.to_string(),
        start_position: StartPosition::Beginning,
        lease_acquire_interval: Duration::from_millis(50),
        lease_renew_interval: Duration::from_millis(100),
        lease_expiration_interval: Duration::from_millis(1000),
        feed_poll_delay: Duration::from_millis(10),
        bootstrap_sleep_time: Duration::from_millis(20),
        ..ProcessorConfig::default()
    }
}

/// A host wired to shared in-memory collaborators.
pub fn host(
    config: ProcessorConfig,
    feed: &InMemoryChangeFeed,
    leases: &InMemoryLeaseManager,
    documents: &Arc<InMemoryDocumentStore>,
    observer: &Recorder,
) -> ChangeFeedHost {
    let host_name = config.host_name.clone();
    ChangeFeedHost::builder(config)
        .source(Arc::new(feed.clone()))
        .lease_manager(Arc::new(leases.for_host(host_name.clone())))
        .lease_store(Arc::new(DocumentLeaseStore::new(
            documents.clone(),
            "",
            host_name,
        )))
        .observer_factory(observer.factory())
        .unhealthiness_strategy(Arc::new(RecordingStrategy::default()))
        .build()
        .expect("valid host")
}

/// Poll `check` until it holds, panicking after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Owners of all leases, by partition.
pub async fn owners(leases: &InMemoryLeaseManager) -> BTreeMap<String, Option<String>> {
    leases
        .list_all_leases()
        .await
        .expect("list leases")
        .into_iter()
        .map(|l| (l.partition_id.to_string(), l.owner))
        .collect()
}

pub async fn owned_by(leases: &InMemoryLeaseManager, host: &str) -> usize {
    owners(leases)
        .await
        .values()
        .filter(|o| o.as_deref() == Some(host))
        .count()
}
