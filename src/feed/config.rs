//! Configuration for the change feed processor.
//!
//! [`ProcessorConfig`] holds every option a host needs. Build it with
//! [`Default`] and struct update syntax, or from `LEASEFEED_*` environment
//! variables with [`ProcessorConfig::from_env`], then call
//! [`ProcessorConfig::validate`] before starting a host.
//!
//! ```rust
//! use std::time::Duration;
//! use leasefeed::feed::{CheckpointFrequency, ProcessorConfig};
//!
//! let config = ProcessorConfig {
//!     host_name: "worker-1".to_string(),
//!     checkpoint_frequency: CheckpointFrequency::every_documents(500),
//!     feed_poll_delay: Duration::from_secs(1),
//!     ..ProcessorConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::error::FeedError;
use crate::constants::{
    DEFAULT_BOOTSTRAP_LOCK_TIME_SECS, DEFAULT_BOOTSTRAP_SLEEP_TIME_SECS,
    DEFAULT_DEGREE_OF_PARALLELISM, DEFAULT_FEED_POLL_DELAY_SECS,
    DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS, DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS,
    DEFAULT_LEASE_PREFIX, DEFAULT_LEASE_RENEW_INTERVAL_SECS,
    DEFAULT_QUERY_PARTITIONS_MAX_BATCH_SIZE, DEFAULT_UNHEALTHINESS_MULTIPLIER,
};
use crate::types::StartPosition;

/// When the processor persists progress.
///
/// With `explicit_checkpoint` the observer checkpoints on its own through its
/// context. Otherwise progress is checkpointed after a delivery once either
/// threshold is reached, or after every delivery when neither is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointFrequency {
    /// The observer calls checkpoint itself.
    pub explicit_checkpoint: bool,
    /// Checkpoint once this many documents were delivered since the last one.
    pub processed_document_count: Option<usize>,
    /// Checkpoint once this much time passed since the last one.
    pub time_interval: Option<Duration>,
}

impl CheckpointFrequency {
    /// Checkpoint after every successful delivery.
    pub fn every_batch() -> Self {
        Self::default()
    }

    /// Checkpoint once `count` documents were delivered.
    pub fn every_documents(count: usize) -> Self {
        Self {
            processed_document_count: Some(count),
            ..Self::default()
        }
    }

    /// Checkpoint once `interval` elapsed.
    pub fn every_interval(interval: Duration) -> Self {
        Self {
            time_interval: Some(interval),
            ..Self::default()
        }
    }

    /// Leave checkpointing to the observer.
    pub fn explicit() -> Self {
        Self {
            explicit_checkpoint: true,
            ..Self::default()
        }
    }
}

/// Configuration of a change feed processor host.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Identity written as lease owner. Must be unique per running host.
    pub host_name: String,
    /// Prefix of lease and bootstrap marker documents.
    pub lease_prefix: String,

    /// How often owned leases are renewed.
    pub lease_renew_interval: Duration,
    /// How often the load balancer tries to take leases.
    pub lease_acquire_interval: Duration,
    /// A lease not renewed for this long may be taken by another host.
    pub lease_expiration_interval: Duration,

    /// Delay between polls once a partition is drained.
    pub feed_poll_delay: Duration,
    /// Page-size hint; `None` lets the store decide.
    pub max_item_count: Option<u32>,
    /// Where partitions without a checkpoint start reading.
    pub start_position: StartPosition,
    /// When progress is persisted.
    pub checkpoint_frequency: CheckpointFrequency,

    /// Minimum number of partitions this host tries to own.
    pub min_partition_count: usize,
    /// Maximum number of partitions this host owns; 0 means unlimited.
    pub max_partition_count: usize,

    /// Fan-out for lease creation and remaining-work estimation.
    pub degree_of_parallelism: usize,
    /// Page size of the partition topology listing.
    pub query_partitions_max_batch_size: u32,

    /// Lifetime of the bootstrap lock.
    pub bootstrap_lock_time: Duration,
    /// Sleep between bootstrap attempts while another host holds the lock.
    pub bootstrap_sleep_time: Duration,

    /// Sustained unhealthiness escalates after this many lease expiration intervals.
    pub unhealthiness_multiplier: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            host_name: default_host_name(),
            lease_prefix: DEFAULT_LEASE_PREFIX.to_string(),
            lease_renew_interval: Duration::from_secs(DEFAULT_LEASE_RENEW_INTERVAL_SECS),
            lease_acquire_interval: Duration::from_secs(DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS),
            lease_expiration_interval: Duration::from_secs(DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS),
            feed_poll_delay: Duration::from_secs(DEFAULT_FEED_POLL_DELAY_SECS),
            max_item_count: None,
            start_position: StartPosition::Now,
            checkpoint_frequency: CheckpointFrequency::default(),
            min_partition_count: 0,
            max_partition_count: 0,
            degree_of_parallelism: DEFAULT_DEGREE_OF_PARALLELISM,
            query_partitions_max_batch_size: DEFAULT_QUERY_PARTITIONS_MAX_BATCH_SIZE,
            bootstrap_lock_time: Duration::from_secs(DEFAULT_BOOTSTRAP_LOCK_TIME_SECS),
            bootstrap_sleep_time: Duration::from_secs(DEFAULT_BOOTSTRAP_SLEEP_TIME_SECS),
            unhealthiness_multiplier: DEFAULT_UNHEALTHINESS_MULTIPLIER,
        }
    }
}

fn default_host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("leasefeed-{}", std::process::id()))
}

impl ProcessorConfig {
    /// Validate configuration consistency.
    ///
    /// Returns every problem found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.host_name.trim().is_empty() {
            errors.push("host_name must not be empty".to_string());
        }

        for (name, value) in [
            ("lease_renew_interval", self.lease_renew_interval),
            ("lease_acquire_interval", self.lease_acquire_interval),
            ("lease_expiration_interval", self.lease_expiration_interval),
            ("bootstrap_lock_time", self.bootstrap_lock_time),
            ("bootstrap_sleep_time", self.bootstrap_sleep_time),
        ] {
            if value.is_zero() {
                errors.push(format!("{name} must be greater than zero"));
            }
        }

        // Renewal must happen before the lease expires
        if self.lease_renew_interval >= self.lease_expiration_interval {
            errors.push(format!(
                "lease_renew_interval ({:?}) must be less than lease_expiration_interval ({:?})",
                self.lease_renew_interval, self.lease_expiration_interval
            ));
        }

        if self.max_partition_count > 0 && self.min_partition_count > self.max_partition_count {
            errors.push(format!(
                "min_partition_count ({}) must not exceed max_partition_count ({})",
                self.min_partition_count, self.max_partition_count
            ));
        }

        if self.degree_of_parallelism == 0 {
            errors.push("degree_of_parallelism must be at least 1".to_string());
        }

        if self.query_partitions_max_batch_size == 0 {
            errors.push("query_partitions_max_batch_size must be at least 1".to_string());
        }

        if self.max_item_count == Some(0) {
            errors.push("max_item_count must be at least 1 when set".to_string());
        }

        if self.unhealthiness_multiplier == 0 {
            errors.push("unhealthiness_multiplier must be at least 1".to_string());
        }

        let frequency = &self.checkpoint_frequency;
        if frequency.processed_document_count == Some(0) {
            errors.push("checkpoint processed_document_count must be at least 1".to_string());
        }
        if frequency.time_interval.is_some_and(|t| t.is_zero()) {
            errors.push("checkpoint time_interval must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate, folding every problem into one [`FeedError::Config`].
    pub fn validated(self) -> Result<Self, FeedError> {
        self.validate()
            .map_err(|errors| FeedError::Config(errors.join("; ")))?;
        Ok(self)
    }

    /// Time after which sustained unhealthiness escalates.
    pub fn unhealthiness_threshold(&self) -> Duration {
        self.lease_expiration_interval
            .saturating_mul(self.unhealthiness_multiplier)
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables (all optional):
    /// - `LEASEFEED_HOST_NAME`: lease owner identity (default: `HOSTNAME`)
    /// - `LEASEFEED_LEASE_PREFIX`: lease document prefix (default: empty)
    /// - `LEASEFEED_LEASE_RENEW_INTERVAL_SECS` (default: 17)
    /// - `LEASEFEED_LEASE_ACQUIRE_INTERVAL_SECS` (default: 13)
    /// - `LEASEFEED_LEASE_EXPIRATION_INTERVAL_SECS` (default: 60)
    /// - `LEASEFEED_FEED_POLL_DELAY_MS` (default: 5000)
    /// - `LEASEFEED_MAX_ITEM_COUNT`: page-size hint (default: unset)
    /// - `LEASEFEED_START_FROM_BEGINNING`: "true" to read retained history
    /// - `LEASEFEED_START_TIME`: RFC 3339 instant to start from
    /// - `LEASEFEED_START_CONTINUATION`: continuation token to start from
    /// - `LEASEFEED_CHECKPOINT_EXPLICIT`: "true" for observer-driven checkpoints
    /// - `LEASEFEED_CHECKPOINT_DOCUMENT_COUNT`: document threshold
    /// - `LEASEFEED_CHECKPOINT_INTERVAL_MS`: time threshold
    /// - `LEASEFEED_MIN_PARTITION_COUNT` / `LEASEFEED_MAX_PARTITION_COUNT`
    /// - `LEASEFEED_DEGREE_OF_PARALLELISM` (default: 25)
    /// - `LEASEFEED_QUERY_PARTITIONS_MAX_BATCH_SIZE` (default: 100)
    /// - `LEASEFEED_BOOTSTRAP_LOCK_TIME_SECS` (default: 30)
    /// - `LEASEFEED_BOOTSTRAP_SLEEP_TIME_SECS` (default: 15)
    /// - `LEASEFEED_UNHEALTHINESS_MULTIPLIER` (default: 5)
    ///
    /// The start position precedence is continuation, then start time, then
    /// beginning, then now.
    pub fn from_env() -> Result<Self, FeedError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, FeedError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let vars = EnvReader { lookup: &lookup };

        let host_name = vars
            .string("LEASEFEED_HOST_NAME")
            .unwrap_or(defaults.host_name);
        let lease_prefix = vars
            .string("LEASEFEED_LEASE_PREFIX")
            .unwrap_or(defaults.lease_prefix);

        let start_position = if let Some(token) = vars.string("LEASEFEED_START_CONTINUATION") {
            StartPosition::Continuation(token)
        } else if let Some(at) = vars.string("LEASEFEED_START_TIME") {
            let parsed = DateTime::parse_from_rfc3339(&at).map_err(|e| {
                FeedError::Config(format!("Invalid LEASEFEED_START_TIME '{at}': {e}"))
            })?;
            StartPosition::PointInTime(parsed.with_timezone(&Utc))
        } else if vars.flag("LEASEFEED_START_FROM_BEGINNING")? {
            StartPosition::Beginning
        } else {
            defaults.start_position
        };

        let checkpoint_frequency = CheckpointFrequency {
            explicit_checkpoint: vars.flag("LEASEFEED_CHECKPOINT_EXPLICIT")?,
            processed_document_count: vars.parse("LEASEFEED_CHECKPOINT_DOCUMENT_COUNT")?,
            time_interval: vars
                .parse::<u64>("LEASEFEED_CHECKPOINT_INTERVAL_MS")?
                .map(Duration::from_millis),
        };

        Ok(Self {
            host_name,
            lease_prefix,
            lease_renew_interval: vars
                .secs("LEASEFEED_LEASE_RENEW_INTERVAL_SECS")?
                .unwrap_or(defaults.lease_renew_interval),
            lease_acquire_interval: vars
                .secs("LEASEFEED_LEASE_ACQUIRE_INTERVAL_SECS")?
                .unwrap_or(defaults.lease_acquire_interval),
            lease_expiration_interval: vars
                .secs("LEASEFEED_LEASE_EXPIRATION_INTERVAL_SECS")?
                .unwrap_or(defaults.lease_expiration_interval),
            feed_poll_delay: vars
                .parse::<u64>("LEASEFEED_FEED_POLL_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.feed_poll_delay),
            max_item_count: vars.parse("LEASEFEED_MAX_ITEM_COUNT")?,
            start_position,
            checkpoint_frequency,
            min_partition_count: vars
                .parse("LEASEFEED_MIN_PARTITION_COUNT")?
                .unwrap_or(defaults.min_partition_count),
            max_partition_count: vars
                .parse("LEASEFEED_MAX_PARTITION_COUNT")?
                .unwrap_or(defaults.max_partition_count),
            degree_of_parallelism: vars
                .parse("LEASEFEED_DEGREE_OF_PARALLELISM")?
                .unwrap_or(defaults.degree_of_parallelism),
            query_partitions_max_batch_size: vars
                .parse("LEASEFEED_QUERY_PARTITIONS_MAX_BATCH_SIZE")?
                .unwrap_or(defaults.query_partitions_max_batch_size),
            bootstrap_lock_time: vars
                .secs("LEASEFEED_BOOTSTRAP_LOCK_TIME_SECS")?
                .unwrap_or(defaults.bootstrap_lock_time),
            bootstrap_sleep_time: vars
                .secs("LEASEFEED_BOOTSTRAP_SLEEP_TIME_SECS")?
                .unwrap_or(defaults.bootstrap_sleep_time),
            unhealthiness_multiplier: vars
                .parse("LEASEFEED_UNHEALTHINESS_MULTIPLIER")?
                .unwrap_or(defaults.unhealthiness_multiplier),
        })
    }
}

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F> EnvReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, FeedError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|v| {
                v.trim()
                    .parse::<T>()
                    .map_err(|e| FeedError::Config(format!("Invalid {key} '{v}': {e}")))
            })
            .transpose()
    }

    fn secs(&self, key: &str) -> Result<Option<Duration>, FeedError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }

    fn flag(&self, key: &str) -> Result<bool, FeedError> {
        match self.string(key) {
            None => Ok(false),
            Some(v) => match v.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(FeedError::Config(format!("Invalid {key} '{v}': expected a boolean"))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ProcessorConfig::default();
        assert_eq!(config.lease_renew_interval, Duration::from_secs(17));
        assert_eq!(config.lease_acquire_interval, Duration::from_secs(13));
        assert_eq!(config.lease_expiration_interval, Duration::from_secs(60));
        assert_eq!(config.feed_poll_delay, Duration::from_secs(5));
        assert_eq!(config.degree_of_parallelism, 25);
        assert_eq!(config.query_partitions_max_batch_size, 100);
        assert_eq!(config.bootstrap_lock_time, Duration::from_secs(30));
        assert_eq!(config.bootstrap_sleep_time, Duration::from_secs(15));
        assert_eq!(config.start_position, StartPosition::Now);
        assert_eq!(config.unhealthiness_threshold(), Duration::from_secs(300));
    }

    #[test]
    fn test_validate_default_config_succeeds() {
        assert!(ProcessorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = ProcessorConfig {
            host_name: " ".to_string(),
            lease_renew_interval: Duration::from_secs(90),
            bootstrap_lock_time: Duration::ZERO,
            degree_of_parallelism: 0,
            min_partition_count: 5,
            max_partition_count: 2,
            ..ProcessorConfig::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 5, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("host_name")));
        assert!(errors.iter().any(|e| e.contains("lease_renew_interval")));
        assert!(errors.iter().any(|e| e.contains("bootstrap_lock_time")));
        assert!(errors.iter().any(|e| e.contains("degree_of_parallelism")));
        assert!(errors.iter().any(|e| e.contains("min_partition_count")));
    }

    #[test]
    fn test_validated_folds_errors() {
        let config = ProcessorConfig {
            degree_of_parallelism: 0,
            ..ProcessorConfig::default()
        };
        assert!(matches!(config.validated(), Err(FeedError::Config(msg)) if msg.contains("degree_of_parallelism")));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ProcessorConfig::from_lookup(lookup(&[
            ("LEASEFEED_HOST_NAME", "host-7"),
            ("LEASEFEED_LEASE_PREFIX", "orders"),
            ("LEASEFEED_FEED_POLL_DELAY_MS", "250"),
            ("LEASEFEED_MAX_ITEM_COUNT", "50"),
            ("LEASEFEED_CHECKPOINT_DOCUMENT_COUNT", "10"),
            ("LEASEFEED_START_FROM_BEGINNING", "true"),
            ("LEASEFEED_MAX_PARTITION_COUNT", "8"),
        ]))
        .unwrap();
        assert_eq!(config.host_name, "host-7");
        assert_eq!(config.lease_prefix, "orders");
        assert_eq!(config.feed_poll_delay, Duration::from_millis(250));
        assert_eq!(config.max_item_count, Some(50));
        assert_eq!(config.checkpoint_frequency.processed_document_count, Some(10));
        assert_eq!(config.start_position, StartPosition::Beginning);
        assert_eq!(config.max_partition_count, 8);
        assert_eq!(config.lease_renew_interval, Duration::from_secs(17));
    }

    #[test]
    fn test_from_lookup_start_precedence() {
        let config = ProcessorConfig::from_lookup(lookup(&[
            ("LEASEFEED_START_FROM_BEGINNING", "true"),
            ("LEASEFEED_START_TIME", "2024-01-02T03:04:05Z"),
        ]))
        .unwrap();
        assert!(matches!(config.start_position, StartPosition::PointInTime(_)));

        let config = ProcessorConfig::from_lookup(lookup(&[
            ("LEASEFEED_START_TIME", "2024-01-02T03:04:05Z"),
            ("LEASEFEED_START_CONTINUATION", "99"),
        ]))
        .unwrap();
        assert_eq!(
            config.start_position,
            StartPosition::Continuation("99".to_string())
        );
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = ProcessorConfig::from_lookup(lookup(&[("LEASEFEED_DEGREE_OF_PARALLELISM", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("LEASEFEED_DEGREE_OF_PARALLELISM"));

        let err = ProcessorConfig::from_lookup(lookup(&[("LEASEFEED_CHECKPOINT_EXPLICIT", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
    }

    #[test]
    fn test_checkpoint_frequency_constructors() {
        assert!(CheckpointFrequency::explicit().explicit_checkpoint);
        assert_eq!(
            CheckpointFrequency::every_documents(5).processed_document_count,
            Some(5)
        );
        assert_eq!(
            CheckpointFrequency::every_interval(Duration::from_secs(1)).time_interval,
            Some(Duration::from_secs(1))
        );
        assert_eq!(CheckpointFrequency::every_batch(), CheckpointFrequency::default());
    }
}
