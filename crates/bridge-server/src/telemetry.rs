//! OpenTelemetry integration for distributed tracing
//!
//! Spans produced through `tracing` are exported over OTLP/gRPC when
//! telemetry is enabled; otherwise only the log layer is installed.

use common::LogFormat;
use common::logging::env_filter;
use opentelemetry::{KeyValue, trace::TracerProvider as _};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// OpenTelemetry tracer guard
///
/// When dropped, flushes all pending spans and shuts down the tracer
pub struct TelemetryGuard;

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

/// Build the OTLP tracer provider
///
/// # Arguments
///
/// * `service_name` - Name of the service (e.g., "bridge-server")
/// * `otlp_endpoint` - OTLP collector endpoint (e.g., "http://localhost:4317")
pub fn init_tracer_provider(
    service_name: &str,
    otlp_endpoint: &str,
) -> Result<TracerProvider, opentelemetry::trace::TraceError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(otlp_endpoint)
        .build()?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
    ]);

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .build())
}

/// Setup tracing-subscriber, with an OpenTelemetry layer when `enabled`
///
/// The returned guard must be kept alive for the duration of the program.
pub fn setup_tracing(
    service_name: &str,
    otlp_endpoint: &str,
    enabled: bool,
    log_level: &str,
    log_format: LogFormat,
) -> Result<Option<TelemetryGuard>, opentelemetry::trace::TraceError> {
    if !enabled {
        common::logging::init(log_level, log_format);
        tracing::info!("Tracing initialized without OpenTelemetry");
        return Ok(None);
    }

    let provider = init_tracer_provider(service_name, otlp_endpoint)?;
    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("bridge-server"));
    opentelemetry::global::set_tracer_provider(provider);

    let registry = tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(telemetry_layer);
    match log_format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }

    tracing::info!(
        service_name = service_name,
        otlp_endpoint = otlp_endpoint,
        "Tracing initialized with OpenTelemetry integration"
    );

    Ok(Some(TelemetryGuard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_without_telemetry() {
        let guard = setup_tracing(
            "test-service",
            "http://localhost:4317",
            false,
            "debug",
            LogFormat::Text,
        );
        assert!(guard.is_ok());
        assert!(guard.unwrap().is_none());
    }
}
