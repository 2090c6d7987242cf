use opentelemetry::{KeyValue, metrics::MeterProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

pub struct Metrics {
    pub batches_ingested: opentelemetry::metrics::Counter<u64>,
    pub batches_processed: opentelemetry::metrics::Counter<u64>,
    pub pokes_sent: opentelemetry::metrics::Counter<u64>,
    pub hydration_duration: opentelemetry::metrics::Histogram<f64>,
    pub active_syncers: opentelemetry::metrics::UpDownCounter<i64>,
    pub active_connections: opentelemetry::metrics::UpDownCounter<i64>,
    pub commit_retries: opentelemetry::metrics::Counter<u64>,

    // Internal tracking for rate calculation
    ingest_total: Arc<AtomicU64>,
}

struct RateState {
    last_count: u64,
    last_tick: Instant,
}

impl Metrics {
    pub fn new(provider: &SdkMeterProvider) -> Self {
        let meter = provider.meter("viewsync");

        let ingest_total = Arc::new(AtomicU64::new(0));
        let count_ref = ingest_total.clone();

        let rate_state = Arc::new(Mutex::new(RateState {
            last_count: 0,
            last_tick: Instant::now(),
        }));

        let _ingest_rate = meter
            .u64_observable_gauge("viewsync_ingest_rate_per_minute")
            .with_description("Upstream batches per minute (calculated window)")
            .with_callback(move |observer| {
                let current_total = count_ref.load(Ordering::Relaxed);

                if let Ok(mut state) = rate_state.lock() {
                    let now = Instant::now();
                    let elapsed = now.duration_since(state.last_tick).as_secs_f64();
                    if elapsed.round() >= 60.0 {
                        let delta = current_total.saturating_sub(state.last_count);
                        let rate_per_min = delta as f64 / elapsed * 60.0;
                        observer.observe(rate_per_min.round() as u64, &[]);

                        state.last_count = current_total;
                        state.last_tick = now;
                    }
                }
            })
            .build();

        Self {
            batches_ingested: meter
                .u64_counter("viewsync_batches_ingested_total")
                .with_description("Upstream batches applied to the replica")
                .build(),
            batches_processed: meter
                .u64_counter("viewsync_batches_processed_total")
                .with_description("Batches processed by view syncers")
                .build(),
            pokes_sent: meter
                .u64_counter("viewsync_pokes_total")
                .with_description("Pokes sent to connected clients")
                .build(),
            hydration_duration: meter
                .f64_histogram("viewsync_hydration_duration_milliseconds")
                .with_description("Time to hydrate a client group or a new query")
                .build(),
            active_syncers: meter
                .i64_up_down_counter("viewsync_syncers_active")
                .with_description("Number of running view syncers")
                .build(),
            active_connections: meter
                .i64_up_down_counter("viewsync_connections_active")
                .with_description("Number of connected clients")
                .build(),
            commit_retries: meter
                .u64_counter("viewsync_commit_retries_total")
                .with_description("Retries of transiently failed record commits")
                .build(),
            ingest_total,
        }
    }

    /// Metrics that record into a provider without exporters.
    pub fn disabled() -> Self {
        Self::new(&SdkMeterProvider::builder().build())
    }

    pub fn inc_ingest(&self, count: u64, attributes: &[KeyValue]) {
        self.ingest_total.fetch_add(count, Ordering::Relaxed);
        self.batches_ingested.add(count, attributes);
    }
}

pub fn init_metrics() -> Result<(SdkMeterProvider, Metrics), anyhow::Error> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:18888".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "viewsync".to_string());

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name)]);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .build()?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(15))
        .build();

    let provider = MeterProviderBuilder::default()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    let metrics = Metrics::new(&provider);

    Ok((provider, metrics))
}
