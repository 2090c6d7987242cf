use anyhow::Context;
use axum::{
    Router,
    body::Bytes,
    extract::{Json, Path, Request, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;
use tracing::field::Empty;
use tracing::{Span, debug, error, info, instrument, warn};
use viewsync::{RedbCvrStore, VersionedBatch};

pub mod background_saver;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod feed;
pub mod metrics;
pub mod open_telemetry;
pub mod persistence;
pub mod syncer_service;

use background_saver::BackgroundSaver;
use config::Config;
use dispatcher::Dispatcher;
use feed::ReplicaFeed;
use metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub feed: Arc<ReplicaFeed>,
    pub dispatcher: Arc<Dispatcher>,
    pub saver: Arc<BackgroundSaver>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Load the schema, the replica snapshot and the record store named by
    /// `config`. The saver is created but not started.
    pub fn build(config: Config, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let schema = persistence::load_schema(config.schema_file.as_deref(), &config.clients_table)?;
        let schema = Arc::new(schema);
        let replica = persistence::load_replica(&config.replica_file, &schema);
        info!(
            version = ?replica.version(),
            rows = replica.row_count(),
            "replica loaded"
        );
        let feed = Arc::new(ReplicaFeed::new(schema, replica, config.replica_readers));

        let store = RedbCvrStore::open(&config.cvr_db)
            .with_context(|| format!("Failed to open CVR store at {}", config.cvr_db.display()))?;
        let router = viewsync::Router::new(config.task_id.clone(), config.workers);
        let dispatcher = Arc::new(Dispatcher::new(
            router,
            Arc::new(store),
            feed.clone(),
            metrics.clone(),
        ));

        let saver = Arc::new(BackgroundSaver::new(
            config.replica_file.clone(),
            feed.clone(),
            config.debounce_ms,
        ));

        Ok(Self {
            config: Arc::new(config),
            feed,
            dispatcher,
            saver,
            metrics,
        })
    }
}

// --- Router Setup ---

pub fn create_app(state: AppState) -> Router {
    let admin = Router::new()
        .route("/ingest", post(ingest_handler))
        .route("/drain", post(drain_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/sync/:version/connect", get(connection::sync_handler))
        .route("/debug/group/:group_id", get(debug_group_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .merge(admin)
        .with_state(state)
}

// --- Server Lifecycle ---

pub async fn run_server() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize observability
    open_telemetry::init_tracing().context("Failed to initialize OpenTelemetry tracing")?;
    let (meter_provider, metrics) =
        metrics::init_metrics().context("Failed to initialize metrics")?;
    let metrics = Arc::new(metrics);

    info!("Starting view-sync server...");

    let config = Config::from_env().context("Invalid configuration")?;
    info!(task_id = %config.task_id, workers = config.workers, "configuration loaded");
    let listen_addr = config.listen_addr.clone();
    let state = AppState::build(config, metrics)?;

    let saver = state.saver.clone();
    tokio::spawn(async move {
        saver.run().await;
    });

    let app = create_app(state.clone());

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind port")?;

    info!(addr = %listen_addr, "Listening for requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state, meter_provider))
        .await
        .context("Server error")?;

    opentelemetry::global::shutdown_tracer_provider();

    Ok(())
}

async fn shutdown_signal(
    state: AppState,
    meter_provider: opentelemetry_sdk::metrics::SdkMeterProvider,
) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Signal received, draining view syncers");
    let drained = state.dispatcher.drain_all(state.config.drain_timeout).await;
    info!(groups = drained, "view syncers drained");

    state.saver.signal_shutdown();
    if tokio::time::timeout(state.config.drain_timeout, state.saver.wait_stopped())
        .await
        .is_err()
    {
        warn!("Background saver did not finish its final save in time");
    }

    if let Err(e) = meter_provider.shutdown() {
        error!(error = %e, "Failed to shutdown meter provider");
    }
}

async fn auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let expected = format!("Bearer {}", state.config.auth_secret);
    match req.headers().get(AUTHORIZATION) {
        Some(header) if header.to_str().unwrap_or_default() == expected => next.run(req).await,
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

// --- Handlers ---

#[instrument(skip_all, fields(version = Empty, changes = Empty))]
async fn ingest_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let span = Span::current();
    let batch: VersionedBatch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => {
            warn!(error = %e, "Invalid ingest payload");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    span.record("version", batch.version);
    span.record("changes", batch.changes.len());

    let applied = match state.feed.ingest(batch).await {
        Ok(applied) => applied,
        Err(e) => {
            warn!(error = %e, "Rejected upstream batch");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    state.metrics.inc_ingest(1, &[]);
    state.saver.trigger_save();
    debug!(applied = applied.changes.len(), "Ingested batch");

    Json(json!({
        "version": applied.version,
        "applied": applied.changes.len(),
    }))
    .into_response()
}

async fn drain_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Drain requested");
    let drained = state.dispatcher.drain_all(state.config.drain_timeout).await;
    Json(json!({ "drained": drained }))
}

async fn debug_group_handler(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> Response {
    match state.dispatcher.summary(&group_id).await {
        Some(summary) => Json(summary).into_response(),
        None => (StatusCode::NOT_FOUND, "group not running").into_response(),
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (replica_version, rows) = {
        let replica = state.feed.snapshot().await;
        (replica.version(), replica.row_count())
    };
    Json(json!({
        "status": "healthy",
        "taskId": state.config.task_id,
        "replicaVersion": replica_version,
        "rows": rows,
        "groups": state.dispatcher.running().await,
    }))
}

async fn version_handler() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocolVersion": viewsync_protocol::PROTOCOL_VERSION,
        "minProtocolVersion": viewsync_protocol::MIN_SERVER_SUPPORTED_SYNC_PROTOCOL,
    }))
}
