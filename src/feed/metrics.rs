//! Prometheus metrics for the change feed processor.
//!
//! Metrics cover:
//! - Feed reading (pages, documents dispatched, observer latency)
//! - Processor failures by error class
//! - Lease operations and checkpoints
//! - Health records and bootstrap lock contention
//! - Remaining-work estimates per partition
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "leasefeed" prefix to
//! avoid name collisions with other libraries using the default Prometheus
//! registry. Registration errors are handled gracefully: if a metric fails to
//! register, an unregistered fallback is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for leasefeed metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("leasefeed".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Feed reading
// =============================================================================

define_counter_vec!(
    PAGES_READ,
    "pages_read_total",
    "Total number of change feed pages read",
    ["partition"]
);
define_counter_vec!(
    DOCUMENTS_DISPATCHED,
    "documents_dispatched_total",
    "Total number of documents handed to observers",
    ["partition"]
);
define_histogram_vec!(
    OBSERVER_DURATION,
    "observer_duration_seconds",
    "Time spent in observer process_changes calls",
    ["status"],
    [
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0
    ]
);
define_counter_vec!(
    PROCESSOR_ERRORS,
    "processor_errors_total",
    "Store failures seen by partition processors, by error class",
    ["class"]
);
define_counter!(
    PAGE_SIZE_DEGRADATIONS,
    "page_size_degradations_total",
    "Number of times a page size was halved after a page-too-large failure"
);

// =============================================================================
// Leases
// =============================================================================

define_counter_vec!(
    LEASE_OPERATIONS,
    "lease_operations_total",
    "Total number of lease operations",
    ["operation", "status"]
);
define_counter_vec!(
    CHECKPOINTS,
    "checkpoints_total",
    "Total number of checkpoints written",
    ["status"]
);
define_gauge!(
    OWNED_PARTITIONS,
    "owned_partitions",
    "Number of partitions owned by this host"
);

// =============================================================================
// Health and bootstrap
// =============================================================================

define_counter_vec!(
    HEALTH_RECORDS,
    "health_records_total",
    "Health monitoring records emitted, by severity",
    ["severity"]
);
define_counter!(
    UNHEALTHINESS_ESCALATIONS,
    "unhealthiness_escalations_total",
    "Number of times sustained unhealthiness invoked the terminal strategy"
);
define_counter_vec!(
    BOOTSTRAP_ATTEMPTS,
    "bootstrap_attempts_total",
    "Bootstrap lock attempts, by outcome",
    ["outcome"]
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retries of store calls, by policy",
    ["policy"]
);

// =============================================================================
// Estimation
// =============================================================================

define_gauge_vec!(
    ESTIMATED_REMAINING_WORK,
    "estimated_remaining_work",
    "Last estimated number of undelivered changes per partition",
    ["partition"]
);

// =============================================================================
// Registration helpers
// =============================================================================

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

// =============================================================================
// Public API
// =============================================================================

/// Force registration of every metric. Idempotent.
pub fn init_metrics() {
    let _ = &*PAGES_READ;
    let _ = &*DOCUMENTS_DISPATCHED;
    let _ = &*OBSERVER_DURATION;
    let _ = &*PROCESSOR_ERRORS;
    let _ = &*PAGE_SIZE_DEGRADATIONS;
    let _ = &*LEASE_OPERATIONS;
    let _ = &*CHECKPOINTS;
    let _ = &*OWNED_PARTITIONS;
    let _ = &*HEALTH_RECORDS;
    let _ = &*UNHEALTHINESS_ESCALATIONS;
    let _ = &*BOOTSTRAP_ATTEMPTS;
    let _ = &*RETRY_ATTEMPTS;
    let _ = &*ESTIMATED_REMAINING_WORK;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a page read from a partition.
pub fn record_page(partition: &str, documents: usize) {
    PAGES_READ.with_label_values(&[partition]).inc();
    DOCUMENTS_DISPATCHED
        .with_label_values(&[partition])
        .inc_by(documents as u64);
}

/// Record one observer dispatch.
pub fn record_observer_call(status: &str, duration_secs: f64) {
    OBSERVER_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Record a store failure seen by a partition processor.
pub fn record_processor_error(class: &str) {
    PROCESSOR_ERRORS.with_label_values(&[class]).inc();
}

/// Record a lease operation.
pub fn record_lease_operation(operation: &str, status: &str) {
    LEASE_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Record a checkpoint write.
pub fn record_checkpoint(status: &str) {
    CHECKPOINTS.with_label_values(&[status]).inc();
}

/// Record a health monitoring record.
pub fn record_health(severity: &str) {
    HEALTH_RECORDS.with_label_values(&[severity]).inc();
}

/// Record a bootstrap lock attempt.
pub fn record_bootstrap_attempt(outcome: &str) {
    BOOTSTRAP_ATTEMPTS.with_label_values(&[outcome]).inc();
}

/// Record a retry of a store call.
pub fn record_retry(policy: &str) {
    RETRY_ATTEMPTS.with_label_values(&[policy]).inc();
}

/// Publish the latest remaining-work estimate of a partition.
pub fn set_remaining_work(partition: &str, remaining: u64) {
    ESTIMATED_REMAINING_WORK
        .with_label_values(&[partition])
        .set(i64::try_from(remaining).unwrap_or(i64::MAX));
}
