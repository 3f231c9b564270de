//! Lease records: ownership and progress of one partition.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::LEASE_ID_SEPARATOR;
use crate::types::PartitionId;

/// Ownership and progress record for one partition.
///
/// At most one live owner holds a lease at any time. Ownership moves only after
/// the previous owner released it or stopped renewing it for longer than the
/// lease expiration interval. `version` is bumped by every write and is what
/// the lease manager uses for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Document id of the lease.
    pub id: String,
    /// Partition this lease covers.
    pub partition_id: PartitionId,
    /// Host currently owning the lease, if any.
    pub owner: Option<String>,
    /// Resume position; `None` means the partition has never been checkpointed.
    pub continuation_token: Option<String>,
    /// Optimistic-concurrency version (etag).
    pub version: u64,
    /// Last time the lease was written.
    pub timestamp: DateTime<Utc>,
    /// Free-form properties carried across ownership changes and splits.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Lease {
    /// A fresh, unowned lease.
    pub fn new(prefix: &str, partition_id: PartitionId, continuation_token: Option<String>) -> Self {
        Self {
            id: lease_id(prefix, &partition_id),
            partition_id,
            owner: None,
            continuation_token,
            version: 0,
            timestamp: Utc::now(),
            properties: BTreeMap::new(),
        }
    }

    /// True when `host` owns this lease.
    pub fn is_owned_by(&self, host: &str) -> bool {
        self.owner.as_deref() == Some(host)
    }

    /// True when nobody owns the lease.
    pub fn is_unowned(&self) -> bool {
        self.owner.as_deref().is_none_or(|o| o.trim().is_empty())
    }

    /// True when the lease was not written for longer than `expiration` as of `now`.
    pub fn is_expired(&self, expiration: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(expiration) {
            Ok(expiration) => self.timestamp + expiration < now,
            Err(_) => false,
        }
    }
}

/// Id of the lease document for a partition.
pub fn lease_id(prefix: &str, partition_id: &PartitionId) -> String {
    format!("{prefix}{LEASE_ID_SEPARATOR}{partition_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lease_is_unowned() {
        let lease = Lease::new("pfx", PartitionId::new("3"), None);
        assert_eq!(lease.id, "pfx..3");
        assert!(lease.is_unowned());
        assert!(!lease.is_owned_by("host-a"));
        assert_eq!(lease.version, 0);
    }

    #[test]
    fn test_blank_owner_counts_as_unowned() {
        let mut lease = Lease::new("", PartitionId::new("3"), None);
        lease.owner = Some("  ".to_string());
        assert!(lease.is_unowned());
        lease.owner = Some("host-a".to_string());
        assert!(!lease.is_unowned());
        assert!(lease.is_owned_by("host-a"));
    }

    #[test]
    fn test_expiry() {
        let mut lease = Lease::new("", PartitionId::new("0"), None);
        let now = Utc::now();
        lease.timestamp = now - chrono::Duration::seconds(61);
        assert!(lease.is_expired(Duration::from_secs(60), now));
        lease.timestamp = now - chrono::Duration::seconds(30);
        assert!(!lease.is_expired(Duration::from_secs(60), now));
    }

    #[test]
    fn test_lease_serde_roundtrip_keeps_properties() {
        let mut lease = Lease::new("", PartitionId::new("0"), Some("12".into()));
        lease.properties.insert("tenant".into(), "a".into());
        let json = serde_json::to_value(&lease).unwrap();
        let back: Lease = serde_json::from_value(json).unwrap();
        assert_eq!(back, lease);
    }
}
