//! Health reporting around partition acquisition.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::controller::PartitionController;
use super::error::{FeedError, FeedResult};
use super::lease::Lease;
use super::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSeverity {
    Critical,
    Error,
    Informational,
}

impl HealthSeverity {
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Informational => "informational",
        }
    }
}

impl fmt::Display for HealthSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_metric_label())
    }
}

/// Operation a health record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoredOperation {
    AcquireLease,
}

impl fmt::Display for MonitoredOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcquireLease => f.write_str("acquire_lease"),
        }
    }
}

/// Outcome of one monitored operation.
#[derive(Debug, Clone)]
pub struct HealthMonitoringRecord {
    pub severity: HealthSeverity,
    pub operation: MonitoredOperation,
    pub lease: Lease,
    /// Rendered failure, for non-informational records.
    pub cause: Option<String>,
}

/// Receives health records.
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    async fn inspect(&self, record: HealthMonitoringRecord);
}

/// [`HealthMonitor`] that logs records and counts them by severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHealthMonitor;

#[async_trait]
impl HealthMonitor for TracingHealthMonitor {
    async fn inspect(&self, record: HealthMonitoringRecord) {
        metrics::record_health(record.severity.as_metric_label());
        let cause = record.cause.as_deref().unwrap_or("");
        match record.severity {
            HealthSeverity::Critical => error!(
                operation = %record.operation,
                partition_id = %record.lease.partition_id,
                cause,
                "Critical health record"
            ),
            HealthSeverity::Error => warn!(
                operation = %record.operation,
                partition_id = %record.lease.partition_id,
                cause,
                "Unhealthy operation"
            ),
            HealthSeverity::Informational => {}
        }
    }
}

/// Reports every acquisition attempt of the wrapped controller.
///
/// Store failures are passed through without a record; they are classified
/// and counted where they happen.
pub struct HealthMonitoringPartitionController {
    inner: Arc<dyn PartitionController>,
    monitor: Arc<dyn HealthMonitor>,
}

impl HealthMonitoringPartitionController {
    pub fn new(inner: Arc<dyn PartitionController>, monitor: Arc<dyn HealthMonitor>) -> Self {
        Self { inner, monitor }
    }
}

#[async_trait]
impl PartitionController for HealthMonitoringPartitionController {
    async fn add_or_update_lease(&self, lease: Lease) -> FeedResult<()> {
        match self.inner.add_or_update_lease(lease.clone()).await {
            Ok(()) => {
                self.monitor
                    .inspect(HealthMonitoringRecord {
                        severity: HealthSeverity::Informational,
                        operation: MonitoredOperation::AcquireLease,
                        lease,
                        cause: None,
                    })
                    .await;
                Ok(())
            }
            Err(e @ FeedError::Store(_)) => Err(e),
            Err(e) => {
                self.monitor
                    .inspect(HealthMonitoringRecord {
                        severity: HealthSeverity::Error,
                        operation: MonitoredOperation::AcquireLease,
                        lease,
                        cause: Some(e.to_string()),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn initialize(&self) -> FeedResult<()> {
        info!("Initializing monitored partition controller");
        self.inner.initialize().await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}
