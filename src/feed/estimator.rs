//! Estimation of changes not yet processed.
//!
//! For each lease the estimator reads one change at the lease's continuation
//! and compares the LSN of that change with the partition's latest LSN from
//! the session token. Reads are spread across a bounded number of workers
//! that drain a shared queue of leases.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

use super::error::FeedResult;
use super::lease::Lease;
use super::metrics;
use super::observability;
use super::traits::{ChangeFeedPage, ChangeFeedRequest, ChangeFeedSource, LeaseManager};
use crate::constants::LSN_PROPERTY_NAME;
use crate::types::{RemainingPartitionWork, StartPosition};

/// Estimates remaining work per partition.
pub struct RemainingWorkEstimator {
    lease_manager: Arc<dyn LeaseManager>,
    source: Arc<dyn ChangeFeedSource>,
    degree_of_parallelism: usize,
}

impl RemainingWorkEstimator {
    pub fn new(
        lease_manager: Arc<dyn LeaseManager>,
        source: Arc<dyn ChangeFeedSource>,
        degree_of_parallelism: usize,
    ) -> Self {
        Self {
            lease_manager,
            source,
            degree_of_parallelism: degree_of_parallelism.max(1),
        }
    }

    /// Total remaining work across all leases; 0 when there are none.
    pub async fn estimated_remaining_work(&self) -> FeedResult<u64> {
        Ok(self
            .estimated_partitions_remaining_work()
            .await?
            .iter()
            .map(|w| w.remaining_work)
            .sum())
    }

    /// Remaining work per partition, ordered by partition id.
    ///
    /// Partitions whose estimate fails are logged and left out.
    pub async fn estimated_partitions_remaining_work(
        &self,
    ) -> FeedResult<Vec<RemainingPartitionWork>> {
        let leases = self.lease_manager.list_all_leases().await?;
        let leases: VecDeque<Lease> = leases
            .into_iter()
            .filter(|l| !l.partition_id.is_blank())
            .collect();
        if leases.is_empty() {
            return Ok(Vec::new());
        }

        let span = observability::estimation_span(leases.len());
        let workers = self.degree_of_parallelism.min(leases.len());
        let queue = Arc::new(Mutex::new(leases));
        let results = Arc::new(Mutex::new(Vec::new()));

        futures::future::join_all((0..workers).map(|_| {
            let queue = queue.clone();
            let results = results.clone();
            async move {
                loop {
                    let Some(lease) = queue.lock().await.pop_front() else {
                        break;
                    };
                    match self.estimate_partition(&lease).await {
                        Ok(work) => results.lock().await.push(work),
                        Err(e) => warn!(
                            partition_id = %lease.partition_id,
                            error = %e,
                            "Failed to estimate remaining work"
                        ),
                    }
                }
            }
        }))
        .instrument(span.clone())
        .await;
        observability::record_success(&span);

        let mut results = std::mem::take(&mut *results.lock().await);
        results.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        for work in &results {
            metrics::set_remaining_work(work.partition_id.as_str(), work.remaining_work);
        }
        Ok(results)
    }

    async fn estimate_partition(&self, lease: &Lease) -> FeedResult<RemainingPartitionWork> {
        let start = match lease.continuation_token.as_deref() {
            Some(token) if !token.trim().is_empty() => StartPosition::Continuation(token.to_string()),
            _ => StartPosition::Beginning,
        };
        let request = ChangeFeedRequest {
            partition_id: lease.partition_id.clone(),
            start,
            max_item_count: Some(1),
        };
        let page = self
            .source
            .read_changes(&request, &CancellationToken::new())
            .await?;
        let remaining_work = remaining_work(&page);
        debug!(partition_id = %lease.partition_id, remaining_work, "Estimated remaining work");
        Ok(RemainingPartitionWork {
            partition_id: lease.partition_id.clone(),
            remaining_work,
        })
    }
}

/// Remaining work implied by a one-item page.
///
/// The position before the first returned change (or the session LSN when
/// nothing was returned) is subtracted from the session LSN. An unknown
/// position counts as one pending change.
fn remaining_work(page: &ChangeFeedPage) -> u64 {
    let session_lsn = parse_number(session_token_lsn(&page.session_token));
    let last_processed = match page.documents.first() {
        Some(doc) => document_lsn(doc) - 1,
        None => session_lsn,
    };
    if last_processed <= 0 {
        return 1;
    }
    u64::try_from(session_lsn - last_processed).unwrap_or(0)
}

/// Global LSN of a session token `"<range>:<segment>[#<segment>...]"`.
///
/// The second segment is the global LSN when present, otherwise the first.
fn session_token_lsn(token: &str) -> &str {
    let segments = token.split_once(':').map_or(token, |(_, rest)| rest);
    let mut parts = segments.split('#');
    let first = parts.next().unwrap_or("");
    parts.next().unwrap_or(first)
}

fn document_lsn(doc: &Value) -> i64 {
    match doc.get(LSN_PROPERTY_NAME) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_else(|| {
            warn!(lsn = %n, "Document LSN out of range");
            0
        }),
        Some(Value::String(s)) => parse_number(s),
        _ => {
            warn!("Document has no LSN");
            0
        }
    }
}

fn parse_number(raw: &str) -> i64 {
    raw.trim().parse().unwrap_or_else(|_| {
        warn!(raw, "Unparsable LSN, treating as 0");
        0
    })
}
