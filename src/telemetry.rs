//! Logging and tracing setup for processes embedding a change feed host.
//!
//! ```rust,no_run
//! use leasefeed::telemetry::{LogFormat, init_logging};
//!
//! init_logging(LogFormat::from_env()).expect("Failed to init logging");
//! ```
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: `json` or `pretty` (default: `pretty`)
//! - `RUST_LOG`: log filter (default: `info`)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: `http://localhost:4317`)
//! - `OTEL_SERVICE_NAME`: service name (default: `leasefeed-host`)
//!
//! # OpenTelemetry (Optional)
//!
//! With the `otel` feature, [`init_telemetry`] also exports the processor's
//! spans (see [`observability`](crate::feed::observability)) over OTLP.
//! Without it, [`init_telemetry`] only installs the log layer.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};
#[cfg(feature = "otel")]
use tracing_opentelemetry::OpenTelemetryLayer;

const DEFAULT_SERVICE_NAME: &str = "leasefeed-host";
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

type InitResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        })
    }
}

impl LogFormat {
    /// Read `LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup("LOG_FORMAT")
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a global subscriber that writes logs in `format`.
///
/// Fails when a global subscriber is already installed.
pub fn init_logging(format: LogFormat) -> InitResult {
    let registry = tracing_subscriber::registry().with(env_filter());
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?,
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
    }
    Ok(())
}

/// OpenTelemetry export settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub otlp_endpoint: String,
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

impl TelemetryConfig {
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            service_name: lookup("OTEL_SERVICE_NAME")
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string()),
            log_format: LogFormat::from_lookup(&lookup),
        }
    }
}

/// Install logging plus OTLP span export.
#[cfg(feature = "otel")]
pub fn init_telemetry(config: TelemetryConfig) -> InitResult {
    use opentelemetry::KeyValue;

    let resource = Resource::new(vec![KeyValue::new(
        "service.name",
        config.service_name.clone(),
    )]);
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()?;
    let provider = sdktrace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();
    let tracer = provider.tracer("leasefeed");
    opentelemetry::global::set_tracer_provider(provider);

    let registry = tracing_subscriber::registry()
        .with(env_filter())
        .with(OpenTelemetryLayer::new(tracer));
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?,
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
    }

    tracing::info!(
        service_name = %config.service_name,
        otlp_endpoint = %config.otlp_endpoint,
        "OpenTelemetry tracing initialized"
    );
    Ok(())
}

/// Install logging only; span export needs the `otel` feature.
#[cfg(not(feature = "otel"))]
pub fn init_telemetry(config: TelemetryConfig) -> InitResult {
    init_logging(config.log_format)
}

/// Flush pending spans.
#[cfg(feature = "otel")]
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

#[cfg(not(feature = "otel"))]
pub fn shutdown_telemetry() {}

pub fn is_otel_enabled() -> bool {
    cfg!(feature = "otel")
}
