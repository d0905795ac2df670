//! Logging and Tracing Setup
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` driven by
//! `RUST_LOG`, a fmt layer, and an optional OpenTelemetry OTLP layer.
//!
//! # Environment Variables
//!
//! - `OTEL_ENABLED`: "false" turns the OTLP layer off (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: http://localhost:4318)
//! - `OTEL_SERVICE_NAME`: service name on exported spans (default: broker-stream-proxy)
//! - `RUST_LOG`: extra filter directives

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_SERVICE_NAME: &str = "broker-stream-proxy";

const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4318";

/// Directives applied on top of `RUST_LOG`.
const DEFAULT_DIRECTIVES: [&str; 4] = [
    "broker_stream_proxy=info",
    "tungstenite=warn",
    "tokio_tungstenite=warn",
    "hyper=warn",
];

/// Shuts the tracer provider down when dropped. Keep it alive in `main`.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shut down OpenTelemetry tracer provider: {e}");
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Export spans over OTLP.
    pub enabled: bool,
    /// OTLP exporter endpoint.
    pub otlp_endpoint: String,
    /// Service name for exported spans.
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            enabled: lookup("OTEL_ENABLED")
                .is_none_or(|v| !v.trim().eq_ignore_ascii_case("false")),
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.otlp_endpoint),
            service_name: lookup("OTEL_SERVICE_NAME")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.service_name),
        }
    }
}

/// Install the subscriber using [`TelemetryConfig::from_env`].
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_config(&TelemetryConfig::from_env())
}

/// Install the subscriber.
///
/// If the OTLP exporter cannot be built, logging still comes up without it.
#[must_use]
#[allow(clippy::expect_used)]
pub fn init_with_config(config: &TelemetryConfig) -> TelemetryGuard {
    let env_filter = DEFAULT_DIRECTIVES
        .iter()
        .fold(EnvFilter::from_default_env(), |filter, directive| {
            filter.add_directive(directive.parse().expect("static filter directive is valid"))
        });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let tracer_provider = if config.enabled {
        build_tracer_provider(config)
    } else {
        None
    };

    let otel_layer = tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    TelemetryGuard { tracer_provider }
}

fn build_tracer_provider(config: &TelemetryConfig) -> Option<SdkTracerProvider> {
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("OTLP exporter unavailable, continuing without span export: {e}");
            return None;
        }
    };

    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(
                opentelemetry_sdk::Resource::builder()
                    .with_service_name(config.service_name.clone())
                    .build(),
            )
            .build(),
    )
}
