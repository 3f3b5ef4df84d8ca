//! HTTP health surface.
//!
//! | Route | Response |
//! |-------|----------|
//! | `GET /health` | `200` when the log answers a ping, `503` otherwise |
//! | `GET /status` | static settings plus live loop counters |

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::{PublishFailurePolicy, WorkerConfig};
use crate::resolver::ChaosConfig;
use crate::stream::StreamLog;
use crate::worker::{StatsSnapshot, WorkerStats};

/// Upper bound on the log ping behind `/health`.
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state of the health routes.
pub struct HealthState {
    log: Arc<dyn StreamLog>,
    stats: Arc<WorkerStats>,
    service: String,
    location: String,
    tasks_stream: String,
    results_stream: String,
    subscription: String,
    reader: String,
    chaos: ChaosConfig,
    publish_failure_policy: PublishFailurePolicy,
}

impl HealthState {
    /// Captures what the routes report from `config`.
    pub fn new(log: Arc<dyn StreamLog>, stats: Arc<WorkerStats>, config: &WorkerConfig) -> Self {
        let subscription = config.subscription();
        Self {
            log,
            stats,
            service: config.service_name(),
            location: config.location.clone(),
            tasks_stream: config.tasks_stream.clone(),
            results_stream: config.results_stream.clone(),
            subscription: subscription.name,
            reader: subscription.reader,
            chaos: config.chaos,
            publish_failure_policy: config.publish_failure_policy,
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    /// `healthy` or `unhealthy`.
    pub status: &'static str,
    /// Service name.
    pub service: String,
    /// Worker location.
    pub location: String,
    /// Whether the log answered a ping.
    pub redis_healthy: bool,
}

/// Stream names in `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamNames {
    /// Task stream.
    pub tasks: String,
    /// Result stream.
    pub results: String,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusResponse {
    /// Service name.
    pub service: String,
    /// Worker location.
    pub location: String,
    /// Stream names.
    pub streams: StreamNames,
    /// Subscription (consumer group) name.
    pub consumer_group: String,
    /// Reader (consumer) id.
    pub consumer: String,
    /// Chaos probabilities.
    pub chaos: ChaosConfig,
    /// Publish failure handling.
    pub publish_failure_policy: PublishFailurePolicy,
    /// Live loop counters.
    pub worker: StatsSnapshot,
}

/// Builds the router.
pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

/// Serves the health routes on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    state: Arc<HealthState>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "health surface listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

/// `GET /health`.
pub async fn health(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = match tokio::time::timeout(PING_TIMEOUT, state.log.ping()).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "health check: log ping failed");
            false
        },
        Err(_) => {
            tracing::warn!("health check: log ping timed out");
            false
        },
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        service: state.service.clone(),
        location: state.location.clone(),
        redis_healthy: healthy,
    };
    (code, Json(body))
}

/// `GET /status`.
pub async fn status(State(state): State<Arc<HealthState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        service: state.service.clone(),
        location: state.location.clone(),
        streams: StreamNames {
            tasks: state.tasks_stream.clone(),
            results: state.results_stream.clone(),
        },
        consumer_group: state.subscription.clone(),
        consumer: state.reader.clone(),
        chaos: state.chaos,
        publish_failure_policy: state.publish_failure_policy,
        worker: state.stats.snapshot(),
    })
}
