//! Bootstrap markers backed by a document store.
//!
//! Two documents coordinate cluster bootstrap:
//! - `{prefix}.info` exists once the store is initialized
//! - `{prefix}.lock` exists (with a TTL) while some host is initializing
//!
//! Both are created once and never updated. The lock expires on its own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use super::error::FeedResult;
use super::traits::{DocumentStore, LeaseStore};
use crate::constants::{INITIALIZED_MARKER_SUFFIX, LOCK_MARKER_SUFFIX};

/// [`LeaseStore`] over any [`DocumentStore`].
pub struct DocumentLeaseStore<D: DocumentStore> {
    documents: Arc<D>,
    prefix: String,
    host_name: String,
}

impl<D: DocumentStore> DocumentLeaseStore<D> {
    /// Create a lease store writing markers under `prefix`.
    pub fn new(documents: Arc<D>, prefix: impl Into<String>, host_name: impl Into<String>) -> Self {
        Self {
            documents,
            prefix: prefix.into(),
            host_name: host_name.into(),
        }
    }

    fn marker_id(&self) -> String {
        format!("{}{}", self.prefix, INITIALIZED_MARKER_SUFFIX)
    }

    fn lock_id(&self) -> String {
        format!("{}{}", self.prefix, LOCK_MARKER_SUFFIX)
    }
}

#[async_trait]
impl<D: DocumentStore + 'static> LeaseStore for DocumentLeaseStore<D> {
    async fn is_initialized(&self) -> FeedResult<bool> {
        Ok(self.documents.read_document(&self.marker_id()).await?.is_some())
    }

    async fn mark_initialized(&self) -> FeedResult<()> {
        let id = self.marker_id();
        let body = json!({ "id": id, "initialized_by": self.host_name, "at": Utc::now() });
        match self.documents.create_document(&id, body, None).await {
            Ok(()) => {
                info!(marker = %id, "Lease store marked initialized");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!(marker = %id, "Lease store already marked initialized");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn lock_initialization(&self, lock_time: Duration) -> FeedResult<bool> {
        let id = self.lock_id();
        let body = json!({ "id": id, "owner": self.host_name, "at": Utc::now() });
        match self.documents.create_document(&id, body, Some(lock_time)).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn release_initialization_lock(&self) -> FeedResult<bool> {
        Ok(self.documents.delete_document(&self.lock_id()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, StoreErrorKind};
    use crate::feed::memory::InMemoryDocumentStore;

    fn store(docs: &Arc<InMemoryDocumentStore>, host: &str) -> DocumentLeaseStore<InMemoryDocumentStore> {
        DocumentLeaseStore::new(docs.clone(), "feed", host)
    }

    #[tokio::test]
    async fn test_mark_initialized_is_idempotent() {
        let docs = Arc::new(InMemoryDocumentStore::new());
        let a = store(&docs, "a");
        assert!(!a.is_initialized().await.unwrap());
        a.mark_initialized().await.unwrap();
        a.mark_initialized().await.unwrap();
        assert!(a.is_initialized().await.unwrap());
        assert!(docs.contains("feed.info").await);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let docs = Arc::new(InMemoryDocumentStore::new());
        let a = store(&docs, "a");
        let b = store(&docs, "b");
        assert!(a.lock_initialization(Duration::from_secs(30)).await.unwrap());
        assert!(!b.lock_initialization(Duration::from_secs(30)).await.unwrap());
        assert!(a.release_initialization_lock().await.unwrap());
        assert!(b.lock_initialization(Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_expires() {
        let docs = Arc::new(InMemoryDocumentStore::new());
        let a = store(&docs, "a");
        let b = store(&docs, "b");
        assert!(a.lock_initialization(Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(b.lock_initialization(Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_failures_propagate() {
        let docs = Arc::new(InMemoryDocumentStore::new());
        docs.fail_next(StoreError::new(StoreErrorKind::ServerError, "down"))
            .await;
        let a = store(&docs, "a");
        let err = a
            .lock_initialization(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::ServerError));
    }

    #[tokio::test]
    async fn test_release_missing_lock() {
        let docs = Arc::new(InMemoryDocumentStore::new());
        let a = store(&docs, "a");
        assert!(!a.release_initialization_lock().await.unwrap());
    }
}
