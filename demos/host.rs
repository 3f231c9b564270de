//! Two change feed hosts sharing in-memory partitions and leases.
//!
//! A writer task appends changes to four partitions while two hosts split the
//! partitions between them, print what they receive, and report how far behind
//! the feed they are.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example host --features test-utilities
//! ```
//!
//! With JSON logging:
//! ```bash
//! LOG_FORMAT=json RUST_LOG=leasefeed=debug cargo run --example host --features test-utilities
//! ```
//!
//! Press Ctrl-C to stop both hosts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use leasefeed::feed::memory::{InMemoryChangeFeed, InMemoryDocumentStore, InMemoryLeaseManager};
use leasefeed::prelude::*;
use leasefeed::telemetry::{LogFormat, init_logging};

const PARTITIONS: usize = 4;

struct Printer {
    host: String,
}

#[async_trait]
impl ChangeFeedObserver for Printer {
    async fn open(&self, context: &ObserverContext) -> Result<(), BoxError> {
        info!(host = %self.host, partition = %context.partition_id(), "Observer opened");
        Ok(())
    }

    async fn close(&self, context: &ObserverContext, reason: CloseReason) -> Result<(), BoxError> {
        info!(host = %self.host, partition = %context.partition_id(), %reason, "Observer closed");
        Ok(())
    }

    async fn process_changes(
        &self,
        context: &ObserverContext,
        changes: Vec<Document>,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        for change in &changes {
            println!("[{}] partition {}: {}", self.host, context.partition_id(), change);
        }
        Ok(())
    }
}

fn build_host(
    name: &str,
    feed: &InMemoryChangeFeed,
    leases: &InMemoryLeaseManager,
    documents: &Arc<InMemoryDocumentStore>,
) -> FeedResult<ChangeFeedHost> {
    let config = ProcessorConfig {
        host_name: name.to_string(),
        start_position: StartPosition::Beginning,
        lease_acquire_interval: Duration::from_secs(1),
        lease_renew_interval: Duration::from_secs(2),
        lease_expiration_interval: Duration::from_secs(10),
        feed_poll_delay: Duration::from_millis(500),
        ..ProcessorConfig::default()
    };
    let host = name.to_string();
    let factory = move || -> Arc<dyn ChangeFeedObserver> {
        Arc::new(Printer { host: host.clone() })
    };

    ChangeFeedHost::builder(config)
        .source(Arc::new(feed.clone()))
        .lease_manager(Arc::new(leases.for_host(name)))
        .lease_store(Arc::new(DocumentLeaseStore::new(documents.clone(), "demo", name)))
        .observer_factory(Arc::new(factory))
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let feed = InMemoryChangeFeed::with_partitions(PARTITIONS).await;
    let leases = InMemoryLeaseManager::new("seed");
    let documents = Arc::new(InMemoryDocumentStore::new());

    let hosts = [
        build_host("host-a", &feed, &leases, &documents)?,
        build_host("host-b", &feed, &leases, &documents)?,
    ];
    for host in &hosts {
        host.start().await?;
    }
    info!(partitions = PARTITIONS, "Hosts started");

    let stop = CancellationToken::new();
    let writer = {
        let feed = feed.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut n = 0u64;
            loop {
                let partition = (n as usize % PARTITIONS).to_string();
                if let Err(e) = feed.append(&partition, json!({ "id": n, "value": n * 10 })).await {
                    warn!(error = %e, "Failed to append change");
                }
                n += 1;
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                }
            }
        })
    };

    let mut report = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                match hosts[0].estimated_partitions_remaining_work().await {
                    Ok(work) => {
                        for w in work {
                            info!(partition = %w.partition_id, remaining = w.remaining_work, "Estimated backlog");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to estimate backlog"),
                }
            }
        }
    }

    info!("Shutting down");
    stop.cancel();
    let _ = writer.await;
    for host in &hosts {
        host.stop().await;
    }
    Ok(())
}
