//! Tracing and OpenTelemetry setup for the coordinator.
//!
//! Without an OTLP endpoint everything goes to stderr through the fmt layer.
//! With one, spans, metrics and log records are exported as well, on a
//! resource tagged with the coordinator's attempt, cache and retention
//! settings so differently tuned deployments can be told apart.

pub mod metrics;
pub mod work;

use opentelemetry::KeyValue;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::config::{Config, CoordinatorConfig};
use crate::error::{Error, Result};

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. "http://localhost:4317".
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Extra resource attributes describing this deployment.
    pub attributes: Vec<KeyValue>,
}

impl TelemetryConfig {
    pub const SERVICE_NAME: &'static str = "handoff";

    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: Self::SERVICE_NAME.to_string(),
            log_level: config.log_level.clone(),
            attributes: coordinator_attributes(&config.coordinator),
        }
    }
}

/// Resource attributes for the coordinator's tuning knobs.
pub fn coordinator_attributes(config: &CoordinatorConfig) -> Vec<KeyValue> {
    vec![
        KeyValue::new("handoff.max_attempts", i64::from(config.max_attempts)),
        KeyValue::new(
            "handoff.attempt_timeout_secs",
            saturating_i64(config.attempt_timeout_secs),
        ),
        KeyValue::new("handoff.backoff_base_ms", saturating_i64(config.backoff_base_ms)),
        KeyValue::new("handoff.backoff_cap_ms", saturating_i64(config.backoff_cap_ms)),
        KeyValue::new("handoff.cache_ttl_secs", saturating_i64(config.cache_ttl_secs)),
        KeyValue::new("handoff.retention_hours", saturating_i64(config.retention_hours)),
    ]
}

fn saturating_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

struct Providers {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Providers {
    fn otlp(endpoint: &str, resource: opentelemetry_sdk::Resource) -> Result<Self> {
        use opentelemetry_otlp::WithExportConfig as _;

        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", e))?;
        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", e))?;
        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", e))?;

        Ok(Self {
            tracer: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            meter: SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(resource.clone())
                .build(),
            logger: SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build(),
        })
    }
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

/// Flushes and shuts down the OTLP pipelines on drop. Hold it for the
/// lifetime of the process.
pub struct TelemetryGuard {
    providers: Option<Providers>,
}

impl TelemetryGuard {
    pub fn force_flush(&self) {
        if let Some(p) = &self.providers {
            let _ = p.tracer.force_flush();
            let _ = p.meter.force_flush();
            let _ = p.logger.force_flush();
        }
    }

    /// Whether OTLP export is active.
    pub fn exporting(&self) -> bool {
        self.providers.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Logs first so records emitted during span shutdown are not lost.
        if let Some(p) = self.providers.take() {
            let _ = p.logger.shutdown();
            let _ = p.meter.shutdown();
            let _ = p.tracer.shutdown();
        }
    }
}

/// Install the global tracing subscriber and, when an endpoint is set, the
/// OTLP trace, metric and log pipelines.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is already
/// installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let stderr = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);

    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr)
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard { providers: None });
    };

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .with_attributes(config.attributes.clone())
        .build();
    let providers = Providers::otlp(endpoint, resource)?;
    opentelemetry::global::set_meter_provider(providers.meter.clone());

    let tracer = providers.tracer.tracer("handoff-rs");
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(
            opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
                &providers.logger,
            ),
        )
        .try_init()
        .map_err(subscriber_error)?;

    Ok(TelemetryGuard {
        providers: Some(providers),
    })
}

fn subscriber_error(e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to init tracing subscriber: {e}"))
}
