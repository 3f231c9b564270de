//! One-time, cluster-wide initialization of the lease store.
//!
//! ```text
//! NotInitialized ──lock taken──▶ Initializing ──leases created──▶ Initialized
//!        │                            │
//!        └──lock contested: sleep─────┘ (failure: error, not marked)
//! ```
//!
//! Any number of hosts may bootstrap concurrently. Exactly one at a time holds
//! the self-expiring lock; the others poll until the store is marked
//! initialized. A failed attempt leaves the store unmarked so the next attempt,
//! on any host, starts over.

use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, info, warn};

use super::error::{FeedError, FeedResult};
use super::metrics;
use super::observability;
use super::synchronizer::PartitionSynchronizer;
use super::traits::LeaseStore;

/// Runs the bootstrap state machine.
pub struct Bootstrapper {
    synchronizer: Arc<dyn PartitionSynchronizer>,
    lease_store: Arc<dyn LeaseStore>,
    lock_time: Duration,
    sleep_time: Duration,
}

impl Bootstrapper {
    /// Fails with [`FeedError::Config`] unless both durations are positive.
    pub fn new(
        synchronizer: Arc<dyn PartitionSynchronizer>,
        lease_store: Arc<dyn LeaseStore>,
        lock_time: Duration,
        sleep_time: Duration,
    ) -> FeedResult<Self> {
        if lock_time.is_zero() {
            return Err(FeedError::Config(
                "bootstrap lock_time must be greater than zero".to_string(),
            ));
        }
        if sleep_time.is_zero() {
            return Err(FeedError::Config(
                "bootstrap sleep_time must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            synchronizer,
            lease_store,
            lock_time,
            sleep_time,
        })
    }

    /// Return once the lease store is initialized.
    ///
    /// Retries contested locks forever with a fixed sleep. Propagates lease
    /// creation failures without marking the store initialized.
    pub async fn initialize(&self) -> FeedResult<()> {
        async {
            loop {
                if self.lease_store.is_initialized().await? {
                    debug!("Lease store already initialized");
                    return Ok(());
                }

                if !self.lease_store.lock_initialization(self.lock_time).await? {
                    metrics::record_bootstrap_attempt("contested");
                    info!(
                        sleep = ?self.sleep_time,
                        "Another host is initializing the lease store, waiting"
                    );
                    tokio::time::sleep(self.sleep_time).await;
                    continue;
                }

                metrics::record_bootstrap_attempt("acquired");
                info!("Initializing lease store");
                let result = self.initialize_locked().await;
                self.release_lock().await;
                return result;
            }
        }
        .instrument(observability::bootstrap_span())
        .await
    }

    async fn initialize_locked(&self) -> FeedResult<()> {
        self.synchronizer.create_missing_leases().await?;
        self.lease_store.mark_initialized().await?;
        info!("Lease store initialized");
        Ok(())
    }

    async fn release_lock(&self) {
        match self.lease_store.release_initialization_lock().await {
            Ok(true) => debug!("Released bootstrap lock"),
            Ok(false) => debug!("Bootstrap lock already expired"),
            Err(e) => warn!(error = %e, "Failed to release bootstrap lock, it will expire"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::error::{StoreError, StoreErrorKind};
    use crate::feed::lease::Lease;

    #[derive(Default)]
    struct ScriptedStore {
        initialized: Mutex<VecDeque<bool>>,
        locks: Mutex<VecDeque<bool>>,
        marked: AtomicUsize,
        released: AtomicUsize,
    }

    impl ScriptedStore {
        fn new(initialized: &[bool], locks: &[bool]) -> Self {
            Self {
                initialized: Mutex::new(initialized.iter().copied().collect()),
                locks: Mutex::new(locks.iter().copied().collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl LeaseStore for ScriptedStore {
        async fn is_initialized(&self) -> FeedResult<bool> {
            Ok(self.initialized.lock().await.pop_front().unwrap_or(true))
        }

        async fn mark_initialized(&self) -> FeedResult<()> {
            self.marked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn lock_initialization(&self, _lock_time: Duration) -> FeedResult<bool> {
            Ok(self.locks.lock().await.pop_front().unwrap_or(false))
        }

        async fn release_initialization_lock(&self) -> FeedResult<bool> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[derive(Default)]
    struct CountingSynchronizer {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PartitionSynchronizer for CountingSynchronizer {
        async fn create_missing_leases(&self) -> FeedResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::new(StoreErrorKind::ServerError, "down").into());
            }
            Ok(())
        }

        async fn split_partition(&self, _lease: &Lease) -> FeedResult<Vec<Lease>> {
            Ok(Vec::new())
        }
    }

    fn bootstrapper(
        sync: &Arc<CountingSynchronizer>,
        store: &Arc<ScriptedStore>,
    ) -> Bootstrapper {
        Bootstrapper::new(
            sync.clone(),
            store.clone(),
            Duration::from_secs(30),
            Duration::from_secs(15),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_initialized_store_never_creates_leases() {
        let sync = Arc::new(CountingSynchronizer::default());
        let store = Arc::new(ScriptedStore::new(&[true, true, true], &[]));
        let boot = bootstrapper(&sync, &store);
        for _ in 0..3 {
            boot.initialize().await.unwrap();
        }
        assert_eq!(sync.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.marked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contested_lock_polls_until_initialized() {
        let sync = Arc::new(CountingSynchronizer::default());
        let store = Arc::new(ScriptedStore::new(&[false, false, true], &[false, false]));
        bootstrapper(&sync, &store).initialize().await.unwrap();
        assert_eq!(sync.calls.load(Ordering::SeqCst), 0);
        assert!(store.initialized.lock().await.is_empty());
        assert!(store.locks.lock().await.is_empty());
        assert_eq!(store.released.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_acquired_lock_creates_and_marks() {
        let sync = Arc::new(CountingSynchronizer::default());
        let store = Arc::new(ScriptedStore::new(&[false], &[true]));
        bootstrapper(&sync, &store).initialize().await.unwrap();
        assert_eq!(sync.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.marked.load(Ordering::SeqCst), 1);
        assert_eq!(store.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_creation_is_not_marked() {
        let sync = Arc::new(CountingSynchronizer {
            fail: true,
            ..CountingSynchronizer::default()
        });
        let store = Arc::new(ScriptedStore::new(&[false], &[true]));
        let err = bootstrapper(&sync, &store).initialize().await.unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::ServerError));
        assert_eq!(store.marked.load(Ordering::SeqCst), 0);
        assert_eq!(store.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_durations_rejected() {
        let sync: Arc<dyn PartitionSynchronizer> = Arc::new(CountingSynchronizer::default());
        let store: Arc<dyn LeaseStore> = Arc::new(ScriptedStore::default());
        assert!(matches!(
            Bootstrapper::new(sync.clone(), store.clone(), Duration::ZERO, Duration::from_secs(1)),
            Err(FeedError::Config(_))
        ));
        assert!(matches!(
            Bootstrapper::new(sync, store, Duration::from_secs(1), Duration::ZERO),
            Err(FeedError::Config(_))
        ));
    }
}
