mod config;
mod dispatch;
mod fetcher;
mod http;
mod idempotency;
mod ingest;
mod lease;
mod llm;
mod metrics;
mod models;
mod ozon;
mod pipeline;
mod responder;
mod scheduler;
mod store;
#[cfg(test)]
mod testutil;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::Settings;
use dispatch::DispatchReport;
use eyre::WrapErr;
use idempotency::ReplyLedger;
use llm::{LlmClient, LlmConfig};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::ApiError;
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use scheduler::Scheduler;
use serde_json::json;
use std::sync::Arc;
use store::{MemoryStore, PostgrestStore, ReviewStore};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "reviews.ops", "worker crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install metrics recorder")?;
    metrics::describe();

    let settings = Settings::from_env();
    let store: Arc<dyn ReviewStore> = match PostgrestStore::from_env() {
        Some(store) => Arc::new(store),
        None => {
            warn!(target = "reviews.store", "SUPABASE_URL or service key not set, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    let queue = dispatch::connect_queue(settings.redis_url.as_deref(), &settings.queue_name);
    let ledger = ReplyLedger::from_url(settings.redis_url.as_deref(), settings.dispatch.ledger_ttl);
    let llm = Arc::new(LlmClient::new(LlmConfig::from_env()));
    let ops_addr = settings.ops_addr;
    let pipeline = Pipeline::new(settings, store, queue, ledger, llm);

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));
    let scheduler = Scheduler::new(pipeline.clone(), cancel.clone()).spawn();

    let app = router(AppState {
        pipeline,
        prometheus_handle,
    });
    let listener = tokio::net::TcpListener::bind(ops_addr)
        .await
        .wrap_err_with(|| format!("failed to bind {ops_addr}"))?;
    info!(target = "reviews.ops", "listening on {ops_addr}");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .wrap_err("ops server failed")?;

    // the server can also stop on its own; make sure the loop follows
    cancel.cancel();
    scheduler.await.wrap_err("scheduler task failed")?;
    info!(target = "reviews.ops", "shutdown complete");
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    prometheus_handle: PrometheusHandle,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/dispatch/resend", post(resend_failed))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Liveness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "ozon-reviews" }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
}

/// Requeue every review whose reply submission failed.
///
/// - Method: `POST`
/// - Path: `/dispatch/resend`
/// - Response: `{ "sent": n, "failed": n }`; `409` while another resend runs
async fn resend_failed(State(state): State<AppState>) -> Result<Json<DispatchReport>, AppError> {
    let report = state.pipeline.resend_failed().await?;
    info!(target = "reviews.ops", sent = report.sent, failed = report.failed, "manual resend");
    Ok(Json(report))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::Busy => StatusCode::CONFLICT,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

async fn watch_signals(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target = "reviews.ops", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(target = "reviews.ops", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(target = "reviews.ops", "shutdown requested");
    cancel.cancel();
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
