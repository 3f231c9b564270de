//! In-memory collaborators for testing.
//!
//! Full-featured in-memory implementations of every collaborator trait, for
//! exercising the processor without a real store:
//!
//! - [`InMemoryChangeFeed`]: deterministic partitions with per-partition LSNs,
//!   splits, removals and scripted failures
//! - [`InMemoryLeaseManager`]: lease records shared by any number of hosts
//! - [`InMemoryDocumentStore`]: documents with optional TTL
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! leasefeed = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::error::{FeedError, FeedResult};
use super::lease::Lease;
use super::traits::{
    ChangeFeedPage, ChangeFeedRequest, ChangeFeedSource, DocumentStore, LeaseManager,
    PartitionPage,
};
use crate::constants::{DEFAULT_MAX_ITEM_COUNT, LSN_PROPERTY_NAME};
use crate::error::{StoreError, StoreErrorKind};
use crate::types::{Document, PartitionId, PartitionRange, StartPosition};

// ============================================================================
// Change feed
// ============================================================================

/// Lifecycle of an in-memory partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    /// Readable and listed.
    Live,
    /// Split into children; reads fail with a split error.
    Split,
    /// Removed; reads fail with not-found.
    Removed,
}

#[derive(Debug, Clone)]
struct StoredChange {
    lsn: u64,
    at: DateTime<Utc>,
    document: Document,
}

#[derive(Debug, Clone)]
struct PartitionLog {
    range: PartitionRange,
    status: PartitionStatus,
    changes: Vec<StoredChange>,
    next_lsn: u64,
}

impl PartitionLog {
    fn new(range: PartitionRange, first_lsn: u64) -> Self {
        Self {
            range,
            status: PartitionStatus::Live,
            changes: Vec::new(),
            next_lsn: first_lsn,
        }
    }

    fn latest_lsn(&self) -> u64 {
        self.next_lsn.saturating_sub(1)
    }
}

#[derive(Debug, Default)]
struct FeedState {
    partitions: BTreeMap<PartitionId, PartitionLog>,
    read_failures: HashMap<PartitionId, VecDeque<StoreError>>,
    list_failures: VecDeque<StoreError>,
    read_calls: HashMap<PartitionId, usize>,
    requests: Vec<ChangeFeedRequest>,
    max_page_size: Option<u32>,
    read_delay: Option<Duration>,
}

/// In-memory change feed with deterministic synthetic data.
///
/// Continuation tokens are the LSN of the last change delivered, so feeding a
/// token back resumes exactly after that change.
#[derive(Debug, Clone, Default)]
pub struct InMemoryChangeFeed {
    state: Arc<RwLock<FeedState>>,
    list_calls: Arc<AtomicUsize>,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// A feed with root partitions `"0"..count`.
    pub async fn with_partitions(count: usize) -> Self {
        let feed = Self::new();
        for i in 0..count {
            feed.add_partition(PartitionRange::root(i.to_string())).await;
        }
        feed
    }

    /// Add a live partition.
    pub async fn add_partition(&self, range: PartitionRange) {
        let mut state = self.state.write().await;
        state
            .partitions
            .insert(range.id.clone(), PartitionLog::new(range, 1));
    }

    /// Append a change; returns its LSN.
    pub async fn append(&self, partition: &str, body: Document) -> FeedResult<u64> {
        let mut state = self.state.write().await;
        let log = state
            .partitions
            .get_mut(&PartitionId::new(partition))
            .filter(|log| log.status == PartitionStatus::Live)
            .ok_or_else(|| StoreError::not_found(format!("partition {partition}")))?;
        let lsn = log.next_lsn;
        log.next_lsn += 1;
        let mut document = body;
        if let Some(obj) = document.as_object_mut() {
            obj.insert(LSN_PROPERTY_NAME.to_string(), json!(lsn));
        }
        log.changes.push(StoredChange {
            lsn,
            at: Utc::now(),
            document,
        });
        Ok(lsn)
    }

    /// Append `count` numbered changes `{"id": "<partition>-<n>"}`.
    pub async fn append_many(&self, partition: &str, count: usize) -> FeedResult<()> {
        for _ in 0..count {
            let n = self.len(partition).await;
            self.append(partition, json!({ "id": format!("{partition}-{n}") }))
                .await?;
        }
        Ok(())
    }

    /// Number of changes stored for a partition.
    pub async fn len(&self, partition: &str) -> usize {
        self.state
            .read()
            .await
            .partitions
            .get(&PartitionId::new(partition))
            .map(|log| log.changes.len())
            .unwrap_or(0)
    }

    /// Split `parent` into `children`.
    ///
    /// Existing changes are dealt to the children round-robin keeping their
    /// LSNs; new changes continue the parent's LSN sequence.
    pub async fn split(&self, parent: &str, children: &[&str]) -> FeedResult<()> {
        let parent_id = PartitionId::new(parent);
        let mut state = self.state.write().await;
        let log = state
            .partitions
            .get_mut(&parent_id)
            .ok_or_else(|| StoreError::not_found(format!("partition {parent}")))?;
        log.status = PartitionStatus::Split;
        let changes = log.changes.clone();
        let next_lsn = log.next_lsn;

        let mut child_logs: Vec<PartitionLog> = children
            .iter()
            .map(|c| PartitionLog::new(PartitionRange::child_of(*c, parent_id.clone()), next_lsn))
            .collect();
        if !child_logs.is_empty() {
            let n = child_logs.len();
            for (i, change) in changes.into_iter().enumerate() {
                child_logs[i % n].changes.push(change);
            }
        }
        for child in child_logs {
            state.partitions.insert(child.range.id.clone(), child);
        }
        Ok(())
    }

    /// Remove a partition; reads of it fail with not-found.
    pub async fn remove_partition(&self, partition: &str) {
        if let Some(log) = self
            .state
            .write()
            .await
            .partitions
            .get_mut(&PartitionId::new(partition))
        {
            log.status = PartitionStatus::Removed;
        }
    }

    /// Fail the next read of `partition` with `error`.
    pub async fn fail_next_read(&self, partition: &str, error: StoreError) {
        self.state
            .write()
            .await
            .read_failures
            .entry(PartitionId::new(partition))
            .or_default()
            .push_back(error);
    }

    /// Fail the next topology listing call with `error`.
    pub async fn fail_next_list(&self, error: StoreError) {
        self.state.write().await.list_failures.push_back(error);
    }

    /// Reject pages larger than `max` (or unbounded requests) as too large.
    pub async fn set_max_page_size(&self, max: Option<u32>) {
        self.state.write().await.max_page_size = max;
    }

    /// Delay every read by `delay`.
    pub async fn set_read_delay(&self, delay: Option<Duration>) {
        self.state.write().await.read_delay = delay;
    }

    /// Number of reads issued against `partition`.
    pub async fn read_count(&self, partition: &str) -> usize {
        self.state
            .read()
            .await
            .read_calls
            .get(&PartitionId::new(partition))
            .copied()
            .unwrap_or(0)
    }

    /// Every read request issued so far, in order.
    pub async fn requests(&self) -> Vec<ChangeFeedRequest> {
        self.state.read().await.requests.clone()
    }

    /// Number of topology listing calls issued so far.
    pub fn list_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn start_after(log: &PartitionLog, start: &StartPosition) -> Result<u64, StoreError> {
        match start {
            StartPosition::Beginning => Ok(0),
            StartPosition::Now => Ok(log.latest_lsn()),
            StartPosition::PointInTime(t) => Ok(log
                .changes
                .iter()
                .find(|c| c.at >= *t)
                .map(|c| c.lsn.saturating_sub(1))
                .unwrap_or_else(|| log.latest_lsn())),
            StartPosition::Continuation(token) => token.parse::<u64>().map_err(|_| {
                StoreError::from_status(400, 0, format!("malformed continuation '{token}'"))
            }),
        }
    }
}

#[async_trait]
impl ChangeFeedSource for InMemoryChangeFeed {
    async fn list_partitions(
        &self,
        continuation: Option<&str>,
        max_items: u32,
    ) -> Result<PartitionPage, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        if let Some(err) = state.list_failures.pop_front() {
            return Err(err);
        }
        let live: Vec<PartitionRange> = state
            .partitions
            .values()
            .filter(|log| log.status == PartitionStatus::Live)
            .map(|log| log.range.clone())
            .collect();
        let skip = continuation
            .map(|c| c.parse::<usize>())
            .transpose()
            .map_err(|_| StoreError::from_status(400, 0, "malformed topology continuation"))?
            .unwrap_or(0);
        let take = max_items.max(1) as usize;
        let partitions: Vec<PartitionRange> = live.iter().skip(skip).take(take).cloned().collect();
        let next = skip + partitions.len();
        Ok(PartitionPage {
            partitions,
            continuation: (next < live.len()).then(|| next.to_string()),
        })
    }

    async fn read_changes(
        &self,
        request: &ChangeFeedRequest,
        cancel: &CancellationToken,
    ) -> Result<ChangeFeedPage, StoreError> {
        let delay = {
            let mut state = self.state.write().await;
            *state
                .read_calls
                .entry(request.partition_id.clone())
                .or_default() += 1;
            state.requests.push(request.clone());
            state.read_delay
        };
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(StoreError::new(StoreErrorKind::Canceled, "operation canceled"));
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(StoreError::new(
                StoreErrorKind::Canceled,
                "operation canceled",
            ));
        }

        let mut state = self.state.write().await;
        if let Some(err) = state
            .read_failures
            .get_mut(&request.partition_id)
            .and_then(|q| q.pop_front())
        {
            return Err(err);
        }
        let max_page_size = state.max_page_size;
        let log = state
            .partitions
            .get(&request.partition_id)
            .ok_or_else(|| StoreError::not_found(format!("partition {}", request.partition_id)))?;
        match log.status {
            PartitionStatus::Live => {}
            PartitionStatus::Split => {
                return Err(StoreError::partition_gone(format!(
                    "partition {} is gone",
                    request.partition_id
                )));
            }
            PartitionStatus::Removed => {
                return Err(StoreError::not_found(format!(
                    "partition {}",
                    request.partition_id
                )));
            }
        }
        if let Some(max) = max_page_size {
            if request.max_item_count.is_none_or(|n| n > max) {
                return Err(StoreError::from_status(
                    400,
                    0,
                    "Response size exceeded. Reduce page size and try again.",
                ));
            }
        }

        let after = Self::start_after(log, &request.start)?;
        let limit = request.max_item_count.unwrap_or(DEFAULT_MAX_ITEM_COUNT) as usize;
        let pending: Vec<&StoredChange> = log.changes.iter().filter(|c| c.lsn > after).collect();
        let page: Vec<&StoredChange> = pending.iter().take(limit).copied().collect();
        let continuation = page.last().map(|c| c.lsn).unwrap_or(after);
        Ok(ChangeFeedPage {
            documents: page.iter().map(|c| c.document.clone()).collect(),
            continuation: continuation.to_string(),
            session_token: format!("{}:-1#{}", request.partition_id, log.latest_lsn()),
            has_more_results: pending.len() > page.len(),
        })
    }
}

// ============================================================================
// Lease manager
// ============================================================================

/// Lease manager operation, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseOp {
    List,
    Create,
    Acquire,
    Renew,
    Release,
    Checkpoint,
    UpdateProperties,
    Delete,
}

#[derive(Debug, Default)]
struct LeaseCounters {
    creates: AtomicUsize,
    checkpoints: AtomicUsize,
    lists: AtomicUsize,
}

/// Lease records shared by any number of hosts.
///
/// Every host gets its own handle via [`InMemoryLeaseManager::for_host`]; all
/// handles see the same leases.
#[derive(Debug, Clone)]
pub struct InMemoryLeaseManager {
    host_name: String,
    prefix: String,
    leases: Arc<RwLock<BTreeMap<PartitionId, Lease>>>,
    failures: Arc<Mutex<HashMap<LeaseOp, VecDeque<StoreError>>>>,
    counters: Arc<LeaseCounters>,
}

impl InMemoryLeaseManager {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            prefix: String::new(),
            leases: Arc::new(RwLock::new(BTreeMap::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(LeaseCounters::default()),
        }
    }

    /// A handle for another host sharing the same leases.
    pub fn for_host(&self, host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            ..self.clone()
        }
    }

    /// Insert or overwrite a lease directly.
    pub async fn insert(&self, lease: Lease) {
        self.leases
            .write()
            .await
            .insert(lease.partition_id.clone(), lease);
    }

    /// Current state of a lease.
    pub async fn get(&self, partition_id: &str) -> Option<Lease> {
        self.leases
            .read()
            .await
            .get(&PartitionId::new(partition_id))
            .cloned()
    }

    /// Give a lease to another owner, as a racing host would.
    pub async fn steal(&self, partition_id: &str, new_owner: &str) {
        if let Some(lease) = self
            .leases
            .write()
            .await
            .get_mut(&PartitionId::new(partition_id))
        {
            lease.owner = Some(new_owner.to_string());
            lease.version += 1;
            lease.timestamp = Utc::now();
        }
    }

    /// Backdate a lease's last write.
    pub async fn set_timestamp(&self, partition_id: &str, timestamp: DateTime<Utc>) {
        if let Some(lease) = self
            .leases
            .write()
            .await
            .get_mut(&PartitionId::new(partition_id))
        {
            lease.timestamp = timestamp;
        }
    }

    /// Fail the next `op` with `error`.
    pub async fn fail_next(&self, op: LeaseOp, error: StoreError) {
        self.failures
            .lock()
            .await
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Number of leases actually created.
    pub fn create_count(&self) -> usize {
        self.counters.creates.load(Ordering::SeqCst)
    }

    /// Number of checkpoints written.
    pub fn checkpoint_count(&self) -> usize {
        self.counters.checkpoints.load(Ordering::SeqCst)
    }

    /// Number of list calls.
    pub fn list_count(&self) -> usize {
        self.counters.lists.load(Ordering::SeqCst)
    }

    async fn injected(&self, op: LeaseOp) -> FeedResult<()> {
        match self
            .failures
            .lock()
            .await
            .get_mut(&op)
            .and_then(|q| q.pop_front())
        {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Apply `update` to the stored lease if this host may write it.
    async fn update_owned<F>(&self, lease: &Lease, expected_owner: Option<&str>, update: F) -> FeedResult<Lease>
    where
        F: FnOnce(&mut Lease),
    {
        let mut leases = self.leases.write().await;
        let stored = leases
            .get_mut(&lease.partition_id)
            .ok_or_else(|| FeedError::lease_lost(&lease.partition_id))?;
        if stored.owner.as_deref() != expected_owner {
            return Err(FeedError::lease_lost(&lease.partition_id));
        }
        update(stored);
        stored.version += 1;
        stored.timestamp = Utc::now();
        Ok(stored.clone())
    }
}

#[async_trait]
impl LeaseManager for InMemoryLeaseManager {
    fn host_name(&self) -> &str {
        &self.host_name
    }

    async fn list_all_leases(&self) -> FeedResult<Vec<Lease>> {
        self.counters.lists.fetch_add(1, Ordering::SeqCst);
        self.injected(LeaseOp::List).await?;
        Ok(self.leases.read().await.values().cloned().collect())
    }

    async fn create_lease_if_not_exists(
        &self,
        partition_id: &PartitionId,
        continuation_token: Option<&str>,
    ) -> FeedResult<Option<Lease>> {
        self.injected(LeaseOp::Create).await?;
        let mut leases = self.leases.write().await;
        if leases.contains_key(partition_id) {
            return Ok(None);
        }
        let lease = Lease::new(
            &self.prefix,
            partition_id.clone(),
            continuation_token.map(str::to_string),
        );
        leases.insert(partition_id.clone(), lease.clone());
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Some(lease))
    }

    async fn acquire(&self, lease: &Lease) -> FeedResult<Lease> {
        self.injected(LeaseOp::Acquire).await?;
        let host = self.host_name.clone();
        let properties = lease.properties.clone();
        self.update_owned(lease, lease.owner.as_deref(), move |stored| {
            stored.owner = Some(host);
            stored.properties = properties;
        })
        .await
    }

    async fn renew(&self, lease: &Lease) -> FeedResult<Lease> {
        self.injected(LeaseOp::Renew).await?;
        self.update_owned(lease, Some(self.host_name.as_str()), |_| {}).await
    }

    async fn release(&self, lease: &Lease) -> FeedResult<()> {
        self.injected(LeaseOp::Release).await?;
        self.update_owned(lease, Some(self.host_name.as_str()), |stored| {
            stored.owner = None;
        })
        .await
        .map(|_| ())
    }

    async fn checkpoint(&self, lease: &Lease, continuation_token: &str) -> FeedResult<Lease> {
        self.injected(LeaseOp::Checkpoint).await?;
        let token = continuation_token.to_string();
        let updated = self
            .update_owned(lease, Some(self.host_name.as_str()), move |stored| {
                stored.continuation_token = Some(token);
            })
            .await?;
        self.counters.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn update_properties(&self, lease: &Lease) -> FeedResult<Lease> {
        self.injected(LeaseOp::UpdateProperties).await?;
        let properties = lease.properties.clone();
        self.update_owned(lease, Some(self.host_name.as_str()), move |stored| {
            stored.properties = properties;
        })
        .await
    }

    async fn delete(&self, lease: &Lease) -> FeedResult<()> {
        self.injected(LeaseOp::Delete).await?;
        self.leases.write().await.remove(&lease.partition_id);
        Ok(())
    }
}

// ============================================================================
// Document store
// ============================================================================

/// Documents with optional TTL.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<String, (Document, Option<Instant>)>>,
    failures: Mutex<VecDeque<StoreError>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next operation with `error`.
    pub async fn fail_next(&self, error: StoreError) {
        self.failures.lock().await.push_back(error);
    }

    /// True when a live (unexpired) document with `id` exists.
    pub async fn contains(&self, id: &str) -> bool {
        matches!(self.documents.read().await.get(id), Some((_, expiry)) if !is_expired(*expiry))
    }

    async fn injected(&self) -> Result<(), StoreError> {
        match self.failures.lock().await.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn is_expired(expiry: Option<Instant>) -> bool {
    expiry.is_some_and(|at| Instant::now() >= at)
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn read_document(&self, id: &str) -> Result<Option<Document>, StoreError> {
        self.injected().await?;
        Ok(match self.documents.read().await.get(id) {
            Some((doc, expiry)) if !is_expired(*expiry) => Some(doc.clone()),
            _ => None,
        })
    }

    async fn create_document(
        &self,
        id: &str,
        body: Document,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.injected().await?;
        let mut documents = self.documents.write().await;
        if let Some((_, expiry)) = documents.get(id) {
            if !is_expired(*expiry) {
                return Err(StoreError::conflict(format!("document {id} exists")));
            }
        }
        documents.insert(id.to_string(), (body, ttl.map(|t| Instant::now() + t)));
        Ok(())
    }

    async fn delete_document(&self, id: &str) -> Result<bool, StoreError> {
        self.injected().await?;
        Ok(match self.documents.write().await.remove(id) {
            Some((_, expiry)) => !is_expired(expiry),
            None => false,
        })
    }
}
