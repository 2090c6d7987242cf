use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    logs::LoggerProvider as SdkLoggerProvider,
    propagation::TraceContextPropagator,
    runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
};
use std::env;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "viewsync=debug,viewsync_server=debug,axum=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into())
}

/// Install the global subscriber. Traces and logs go to the OTLP collector,
/// or to stdout when `VIEWSYNC_LOG_FORMAT=console`.
pub fn init_tracing() -> Result<(), anyhow::Error> {
    if env::var("VIEWSYNC_LOG_FORMAT").is_ok_and(|f| f == "console") {
        Registry::default()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer())
            .init();
        return Ok(());
    }

    let otlp_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:18888".to_string());

    let service_name = env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "viewsync".to_string());

    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name.clone())]);

    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter, runtime::Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource.clone())
        .build();

    // Take the tracer before the provider moves into the global slot.
    let tracer = tracer_provider.tracer(service_name);
    global::set_tracer_provider(tracer_provider);
    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    let log_exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()?;

    let logger_provider = SdkLoggerProvider::builder()
        .with_batch_exporter(log_exporter, runtime::Tokio)
        .with_resource(resource)
        .build();

    let log_layer = OpenTelemetryTracingBridge::new(&logger_provider);

    Registry::default()
        .with(env_filter())
        .with(telemetry_layer)
        .with(log_layer)
        .init();

    Ok(())
}
