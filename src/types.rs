//! Type-safe wrappers for change feed primitives.
//!
//! These newtypes keep partition identifiers and continuation tokens from being
//! mixed up with the many other strings that flow through the processor.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single change record as delivered by the source store.
pub type Document = serde_json::Value;

/// Identifier of a partition of the source change stream.
///
/// Backed by `Arc<str>` so that cloning (which happens on every lease, page and
/// log line) is O(1).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(Arc<str>);

impl PartitionId {
    /// Create a partition id from any string-like value.
    pub fn new(id: impl AsRef<str>) -> Self {
        PartitionId(Arc::from(id.as_ref()))
    }

    /// Borrow the raw id.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id is empty or whitespace; such leases are skipped.
    #[inline]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for PartitionId {
    fn from(value: &str) -> Self {
        PartitionId::new(value)
    }
}

impl From<String> for PartitionId {
    fn from(value: String) -> Self {
        PartitionId(Arc::from(value))
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a change feed read starts.
///
/// A continuation token always wins over the other variants; the processor only
/// uses the configured start once, before the first page is read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Only changes made after the read begins.
    #[default]
    Now,
    /// Every change still retained by the store.
    Beginning,
    /// Changes made at or after the given instant.
    PointInTime(DateTime<Utc>),
    /// Resume right after the batch that produced this token.
    Continuation(String),
}

impl StartPosition {
    /// Resolve the position for a lease: its saved continuation if any,
    /// otherwise the configured fallback.
    pub fn resolve(continuation: Option<&str>, fallback: &StartPosition) -> StartPosition {
        match continuation {
            Some(token) if !token.is_empty() => StartPosition::Continuation(token.to_string()),
            _ => fallback.clone(),
        }
    }

    /// The continuation token if this position carries one.
    pub fn continuation(&self) -> Option<&str> {
        match self {
            StartPosition::Continuation(token) => Some(token),
            _ => None,
        }
    }
}

/// A partition as reported by the topology listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRange {
    /// Partition id.
    pub id: PartitionId,
    /// Ids of the partitions this one was split from.
    #[serde(default)]
    pub parents: Vec<PartitionId>,
}

impl PartitionRange {
    /// A partition with no recorded parents.
    pub fn root(id: impl Into<PartitionId>) -> Self {
        Self {
            id: id.into(),
            parents: Vec::new(),
        }
    }

    /// A partition produced by splitting `parent`.
    pub fn child_of(id: impl Into<PartitionId>, parent: impl Into<PartitionId>) -> Self {
        Self {
            id: id.into(),
            parents: vec![parent.into()],
        }
    }

    /// True when `parent` is one of the recorded parents.
    pub fn is_child_of(&self, parent: &PartitionId) -> bool {
        self.parents.iter().any(|p| p == parent)
    }
}

/// Remaining undelivered work for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemainingPartitionWork {
    /// Partition the estimate belongs to.
    pub partition_id: PartitionId,
    /// Estimated number of changes not yet checkpointed.
    pub remaining_work: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_id_display_and_blank() {
        let id = PartitionId::new("7");
        assert_eq!(id.to_string(), "7");
        assert!(!id.is_blank());
        assert!(PartitionId::new("  ").is_blank());
        assert!(PartitionId::new("").is_blank());
    }

    #[test]
    fn test_start_position_prefers_continuation() {
        let fallback = StartPosition::Beginning;
        assert_eq!(
            StartPosition::resolve(Some("42"), &fallback),
            StartPosition::Continuation("42".to_string())
        );
        assert_eq!(StartPosition::resolve(None, &fallback), StartPosition::Beginning);
        assert_eq!(StartPosition::resolve(Some(""), &fallback), StartPosition::Beginning);
    }

    #[test]
    fn test_partition_range_parentage() {
        let child = PartitionRange::child_of("3", "1");
        assert!(child.is_child_of(&PartitionId::new("1")));
        assert!(!child.is_child_of(&PartitionId::new("2")));
        assert!(!PartitionRange::root("1").is_child_of(&PartitionId::new("1")));
    }

    #[test]
    fn test_partition_id_serde_transparent() {
        let id = PartitionId::new("abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc\"");
        let back: PartitionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
