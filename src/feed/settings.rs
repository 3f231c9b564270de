//! Per-partition processor settings.

use std::time::Duration;

use super::config::ProcessorConfig;
use super::lease::Lease;
use crate::types::{PartitionId, StartPosition};

/// Snapshot of what one partition processor needs, taken when it is created.
///
/// Never changes afterwards; the processor keeps its live page size separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSettings {
    pub partition_id: PartitionId,
    /// The lease's continuation if any, else the configured start position.
    pub start: StartPosition,
    /// Configured page-size hint.
    pub max_item_count: Option<u32>,
    pub feed_poll_delay: Duration,
}

impl ProcessorSettings {
    pub fn from_lease(lease: &Lease, config: &ProcessorConfig) -> Self {
        Self {
            partition_id: lease.partition_id.clone(),
            start: StartPosition::resolve(
                lease.continuation_token.as_deref(),
                &config.start_position,
            ),
            max_item_count: config.max_item_count,
            feed_poll_delay: config.feed_poll_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpointed_lease_resumes_from_continuation() {
        let lease = Lease::new("", PartitionId::new("4"), Some("88".to_string()));
        let config = ProcessorConfig {
            start_position: StartPosition::Beginning,
            max_item_count: Some(10),
            ..ProcessorConfig::default()
        };
        let settings = ProcessorSettings::from_lease(&lease, &config);
        assert_eq!(settings.partition_id.as_str(), "4");
        assert_eq!(settings.start, StartPosition::Continuation("88".to_string()));
        assert_eq!(settings.max_item_count, Some(10));
    }

    #[test]
    fn test_fresh_lease_uses_configured_start() {
        let lease = Lease::new("", PartitionId::new("4"), None);
        let config = ProcessorConfig {
            start_position: StartPosition::Beginning,
            ..ProcessorConfig::default()
        };
        let settings = ProcessorSettings::from_lease(&lease, &config);
        assert_eq!(settings.start, StartPosition::Beginning);
        assert_eq!(settings.feed_poll_delay, config.feed_poll_delay);
    }
}
