//! Tracing spans for the critical paths of the processor.
//!
//! With the `otel` feature these spans are exported through OpenTelemetry by
//! the layer installed in [`telemetry`](crate::telemetry); otherwise they are
//! plain `tracing` spans.
//!
//! # Critical Paths Instrumented
//!
//! - Bootstrap of the lease store
//! - Per-partition processing (one long-lived span per supervisor)
//! - Lease ownership operations
//! - Remaining-work estimation

use std::fmt;

use tracing::{Level, Span, span};

use crate::types::PartitionId;

/// Lease ownership operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOperation {
    Acquire,
    Renew,
    Release,
    Split,
}

impl fmt::Display for LeaseOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acquire => write!(f, "acquire"),
            Self::Renew => write!(f, "renew"),
            Self::Release => write!(f, "release"),
            Self::Split => write!(f, "split"),
        }
    }
}

/// Span covering one bootstrap of the lease store.
pub fn bootstrap_span() -> Span {
    span!(
        Level::INFO,
        "lease_store.bootstrap",
        otel.status_code = tracing::field::Empty,
    )
}

/// Span covering the whole processing lifetime of one partition.
pub fn partition_processing_span(partition_id: &PartitionId, host: &str) -> Span {
    span!(
        Level::INFO,
        "partition.processing",
        partition_id = %partition_id,
        host = %host,
        otel.kind = "consumer",
        otel.status_code = tracing::field::Empty,
    )
}

/// Span covering one lease ownership operation.
pub fn lease_operation_span(
    partition_id: &PartitionId,
    host: &str,
    operation: LeaseOperation,
) -> Span {
    span!(
        Level::INFO,
        "lease.ownership",
        partition_id = %partition_id,
        host = %host,
        operation = %operation,
        otel.status_code = tracing::field::Empty,
    )
}

/// Span covering one remaining-work estimation.
pub fn estimation_span(leases: usize) -> Span {
    span!(
        Level::DEBUG,
        "estimator.remaining_work",
        leases,
        otel.status_code = tracing::field::Empty,
    )
}

/// Mark a span as failed.
pub fn record_error(span: &Span, error: &dyn fmt::Display) {
    span.record("otel.status_code", "ERROR");
    tracing::debug!(parent: span, error = %error, "Operation failed");
}

/// Mark a span as successful.
pub fn record_success(span: &Span) {
    span.record("otel.status_code", "OK");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Instrument;

    #[test]
    fn test_lease_operation_display() {
        assert_eq!(LeaseOperation::Acquire.to_string(), "acquire");
        assert_eq!(LeaseOperation::Renew.to_string(), "renew");
        assert_eq!(LeaseOperation::Release.to_string(), "release");
        assert_eq!(LeaseOperation::Split.to_string(), "split");
    }

    #[tokio::test]
    async fn test_spans_instrument_futures() {
        let pid = PartitionId::new("0");
        let span = lease_operation_span(&pid, "host-a", LeaseOperation::Acquire);
        record_success(&span);
        async {}.instrument(span).await;

        let span = partition_processing_span(&pid, "host-a");
        record_error(&span, &"boom");
        async {}.instrument(span).await;
    }
}
