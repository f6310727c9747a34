//! Logging and metric export setup
//!
//! Logs go to stdout as text or JSON lines. When an OTLP endpoint is
//! configured the meter provider behind [`crate::Metrics`] exports there;
//! otherwise every instrument stays a no-op.

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize OTLP metrics exporter
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),

    /// Unknown log format
    #[error("unsupported log format {0:?}, expected \"text\" or \"json\"")]
    LogFormat(String),
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable lines with RFC3339 timestamps
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(TelemetryError::LogFormat(other.to_string())),
        }
    }
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to exported metrics
    pub service_name: String,
    /// Log line format
    pub log_format: LogFormat,
    /// Default filter directive when `RUST_LOG` is unset (e.g. "debug")
    pub log_level: String,
    /// OTLP endpoint for metric export (e.g. "http://otel-collector:4317")
    pub otlp_endpoint: Option<String>,
}

/// Install the log subscriber and, with an endpoint, the metric exporter
///
/// Must be called at most once per process, before the meter is used.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    if let Some(endpoint) = &config.otlp_endpoint {
        init_otlp_metrics(endpoint, &config.service_name)?;
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(&config.log_level));

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_target(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

/// The configured level for certificator, quieter defaults for the client stack
fn default_filter(level: &str) -> EnvFilter {
    EnvFilter::new(format!("{level},kube=info,tower=warn,hyper=warn,rustls=warn"))
}

fn init_otlp_metrics(endpoint: &str, service_name: &str) -> Result<(), TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(build_resource(service_name))
        .build();

    global::set_meter_provider(provider);
    Ok(())
}

fn build_resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];
    // Set via Deployment downward API
    if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace));
    }
    Resource::new(attributes)
}
