//! Distribution of leases across hosts.
//!
//! Every host runs a [`PartitionLoadBalancer`]. Each round it reads all
//! leases and asks an [`EqualPartitionsBalancingStrategy`] which of them to
//! take so that every live host ends up with about the same number of
//! partitions. Free and expired leases are taken first; when there are none,
//! one lease is stolen from the most loaded host per round, which makes the
//! distribution converge without thrashing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::controller::PartitionController;
use super::lease::Lease;
use super::traits::LeaseManager;

/// Add +/- 15% jitter to an interval so hosts started together do not poll
/// the lease store in lockstep.
pub(crate) fn with_jitter(base: Duration) -> Duration {
    let jitter_factor = 0.85 + fastrand::f64() * 0.30;
    Duration::from_secs_f64(base.as_secs_f64() * jitter_factor)
}

/// Picks leases so that partitions are spread evenly across hosts.
#[derive(Debug, Clone)]
pub struct EqualPartitionsBalancingStrategy {
    host_name: String,
    min_partition_count: usize,
    /// 0 means unlimited.
    max_partition_count: usize,
    lease_expiration_interval: Duration,
}

impl EqualPartitionsBalancingStrategy {
    pub fn new(
        host_name: impl Into<String>,
        min_partition_count: usize,
        max_partition_count: usize,
        lease_expiration_interval: Duration,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            min_partition_count,
            max_partition_count,
            lease_expiration_interval,
        }
    }

    /// Leases this host should try to acquire now.
    pub fn select_leases_to_take(&self, all_leases: &[Lease], now: DateTime<Utc>) -> Vec<Lease> {
        if all_leases.is_empty() {
            return Vec::new();
        }

        let mut leases: Vec<&Lease> = all_leases.iter().collect();
        leases.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));

        let mut expired = Vec::new();
        let mut per_worker: BTreeMap<&str, usize> = BTreeMap::new();
        per_worker.insert(self.host_name.as_str(), 0);
        for lease in &leases {
            match lease.owner.as_deref() {
                Some(owner) if !lease.is_expired(self.lease_expiration_interval, now) => {
                    *per_worker.entry(owner).or_default() += 1;
                }
                _ => expired.push(*lease),
            }
        }

        let target = self.target_partition_count(leases.len(), per_worker.len());
        let mine = per_worker.get(self.host_name.as_str()).copied().unwrap_or(0);
        if mine >= target {
            return Vec::new();
        }
        let needed = target - mine;

        if !expired.is_empty() {
            return expired.into_iter().take(needed).cloned().collect();
        }

        // One steal per round from the most loaded worker (first by name on ties).
        let Some((&busiest, &busiest_count)) = per_worker
            .iter()
            .filter(|(owner, _)| **owner != self.host_name)
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        else {
            return Vec::new();
        };
        let allowance = target - usize::from(needed > 1);
        if busiest_count <= allowance {
            return Vec::new();
        }
        leases
            .into_iter()
            .find(|l| l.owner.as_deref() == Some(busiest))
            .map(|l| vec![l.clone()])
            .unwrap_or_default()
    }

    /// `ceil(partitions / workers)` clamped to the configured bounds.
    fn target_partition_count(&self, partitions: usize, workers: usize) -> usize {
        let mut target = partitions.div_ceil(workers.max(1));
        if self.max_partition_count > 0 && target > self.max_partition_count {
            target = self.max_partition_count;
        }
        if self.min_partition_count > 0 && target < self.min_partition_count {
            target = self.min_partition_count;
        }
        target
    }
}

/// Periodically takes the leases chosen by the strategy.
pub struct PartitionLoadBalancer {
    controller: Arc<dyn PartitionController>,
    lease_manager: Arc<dyn LeaseManager>,
    strategy: EqualPartitionsBalancingStrategy,
    interval: Duration,
}

impl PartitionLoadBalancer {
    pub fn new(
        controller: Arc<dyn PartitionController>,
        lease_manager: Arc<dyn LeaseManager>,
        strategy: EqualPartitionsBalancingStrategy,
        interval: Duration,
    ) -> Self {
        Self {
            controller,
            lease_manager,
            strategy,
            interval,
        }
    }

    /// One balancing round. Returns how many leases were taken.
    pub async fn balance_once(&self) -> usize {
        let all = match self.lease_manager.list_all_leases().await {
            Ok(all) => all,
            Err(e) => {
                warn!(error = %e, "Failed to list leases for balancing");
                return 0;
            }
        };

        let to_take = self.strategy.select_leases_to_take(&all, Utc::now());
        let mut taken = 0;
        for lease in to_take {
            let partition_id = lease.partition_id.clone();
            match self.controller.add_or_update_lease(lease).await {
                Ok(()) => taken += 1,
                Err(e) => {
                    debug!(partition_id = %partition_id, error = %e, "Failed to take lease");
                }
            }
        }
        if taken > 0 {
            info!(taken, total = all.len(), "Took leases");
        }
        taken
    }

    /// Balance until `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) {
        loop {
            self.balance_once().await;
            tokio::select! {
                _ = tokio::time::sleep(with_jitter(self.interval)) => {}
                _ = cancel.cancelled() => {
                    info!("Load balancer received shutdown signal");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartitionId;

    const EXPIRATION: Duration = Duration::from_secs(60);

    fn lease(pid: &str, owner: Option<&str>, now: DateTime<Utc>) -> Lease {
        let mut lease = Lease::new("", PartitionId::new(pid), None);
        lease.owner = owner.map(str::to_string);
        lease.timestamp = now;
        lease
    }

    fn ids(leases: &[Lease]) -> Vec<&str> {
        leases.iter().map(|l| l.partition_id.as_str()).collect()
    }

    fn strategy(host: &str) -> EqualPartitionsBalancingStrategy {
        EqualPartitionsBalancingStrategy::new(host, 0, 0, EXPIRATION)
    }

    #[test]
    fn test_with_jitter_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..1000 {
            let d = with_jitter(base);
            assert!(d >= Duration::from_millis(8500) && d <= Duration::from_millis(11500));
        }
    }

    #[test]
    fn test_no_leases_takes_nothing() {
        assert!(strategy("a").select_leases_to_take(&[], Utc::now()).is_empty());
    }

    #[test]
    fn test_single_host_takes_all_free_leases() {
        let now = Utc::now();
        let all: Vec<Lease> = (0..4).map(|i| lease(&i.to_string(), None, now)).collect();
        let taken = strategy("a").select_leases_to_take(&all, now);
        assert_eq!(ids(&taken), vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn test_expired_leases_count_as_free() {
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(120);
        let all = vec![
            lease("0", Some("b"), stale),
            lease("1", Some("b"), now),
            lease("2", Some("b"), now),
            lease("3", Some("b"), now),
        ];
        // workers {a, b}: target 2, only the expired one is free
        let taken = strategy("a").select_leases_to_take(&all, now);
        assert_eq!(ids(&taken), vec!["0"]);
    }

    #[test]
    fn test_steals_one_from_busiest() {
        let now = Utc::now();
        let all = vec![
            lease("0", Some("b"), now),
            lease("1", Some("b"), now),
            lease("2", Some("b"), now),
            lease("3", Some("b"), now),
        ];
        let taken = strategy("a").select_leases_to_take(&all, now);
        assert_eq!(ids(&taken), vec!["0"]);
    }

    #[test]
    fn test_balanced_takes_nothing() {
        let now = Utc::now();
        let all = vec![
            lease("0", Some("a"), now),
            lease("1", Some("a"), now),
            lease("2", Some("b"), now),
            lease("3", Some("b"), now),
        ];
        assert!(strategy("a").select_leases_to_take(&all, now).is_empty());
        assert!(strategy("b").select_leases_to_take(&all, now).is_empty());
    }

    #[test]
    fn test_no_steal_when_off_by_one() {
        let now = Utc::now();
        // workers {a, b}: target 2, a needs 1, b holds 2 which is not above target
        let all = vec![
            lease("0", Some("a"), now),
            lease("1", Some("b"), now),
            lease("2", Some("b"), now),
        ];
        assert!(strategy("a").select_leases_to_take(&all, now).is_empty());
    }

    #[test]
    fn test_max_partition_count_caps_target() {
        let now = Utc::now();
        let all: Vec<Lease> = (0..6).map(|i| lease(&i.to_string(), None, now)).collect();
        let capped = EqualPartitionsBalancingStrategy::new("a", 0, 2, EXPIRATION);
        assert_eq!(capped.select_leases_to_take(&all, now).len(), 2);
    }

    #[test]
    fn test_min_partition_count_raises_target() {
        let now = Utc::now();
        let all = vec![
            lease("0", None, now),
            lease("1", None, now),
            lease("2", Some("b"), now),
            lease("3", Some("b"), now),
        ];
        let eager = EqualPartitionsBalancingStrategy::new("a", 3, 0, EXPIRATION);
        assert_eq!(ids(&eager.select_leases_to_take(&all, now)), vec!["0", "1"]);
    }
}
