use crate::errors::{QueueError, Result};
use crate::job::KilnRequest;
use crate::protocol::{PollBody, PollHandler, PollReply, XML_CONTENT_TYPE};
use crate::queue::{QueueManager, QueueSnapshot};
use crate::tasks::{TaskCounts, TaskRecord};
use crate::telemetry::TelemetryCollector;
use axum::{
    body::Bytes,
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// HTTP API server state
#[derive(Clone)]
pub struct ApiState {
    pub queue_manager: Arc<QueueManager>,
    pub poll_handler: Arc<PollHandler>,
    pub telemetry: Arc<TelemetryCollector>,
    /// Refuse intake of a record already queued byte for byte
    pub reject_duplicates: bool,
    pub start_time: std::time::Instant,
}

/// Insert trigger payload; `record` is the new `kiln_requests` row
#[derive(Debug, Deserialize)]
pub struct IntakeRequest {
    /// Null when absent, which falls through to the missing account_id reply
    #[serde(default)]
    pub record: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct IntakeResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_length: Option<u64>,
}

impl IntakeResponse {
    fn failure(status: StatusCode, message: &str) -> Response {
        (
            status,
            Json(IntakeResponse {
                success: false,
                message: message.to_string(),
                queue_length: None,
            }),
        )
            .into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub active_workers: usize,
    pub tasks: TaskCounts,
}

#[derive(Debug, Serialize)]
pub struct TasksResponse {
    pub counts: TaskCounts,
    pub tasks: Vec<TaskRecord>,
}

#[derive(Debug, Deserialize)]
pub struct TasksQuery {
    pub limit: Option<usize>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
}

impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        let error_string = self.to_string();
        let (status, message) = match self {
            QueueError::InvalidRecord(msg) => (StatusCode::BAD_REQUEST, msg),
            QueueError::Duplicate(msg) => (StatusCode::CONFLICT, msg),
            QueueError::QueueTimeout(msg)
            | QueueError::QueueUnavailable(msg)
            | QueueError::StoreUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            details: Some(error_string),
        });

        (status, body).into_response()
    }
}

impl IntoResponse for PollReply {
    fn into_response(self) -> Response {
        match self.body {
            PollBody::Xml(xml) => {
                (self.status, [(header::CONTENT_TYPE, XML_CONTENT_TYPE)], xml).into_response()
            }
            PollBody::Json(value) => (self.status, Json(value)).into_response(),
        }
    }
}

/// POST /api/webhook/:account_id - Printer poll
async fn handle_poll(
    State(state): State<ApiState>,
    Path(account_id): Path<String>,
    body: Bytes,
) -> PollReply {
    state.poll_handler.handle(&account_id, &body).await
}

/// POST /api/webhook/add-print-job - Queue a newly inserted kiln request
async fn handle_add_print_job(
    State(state): State<ApiState>,
    Json(request): Json<IntakeRequest>,
) -> Response {
    let account_id = request
        .record
        .get("account_id")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let Some(account_id) = account_id else {
        warn!("Intake payload without account_id");
        return IntakeResponse::failure(StatusCode::BAD_REQUEST, "Missing account_id");
    };

    let record = match KilnRequest::from_value(request.record) {
        Ok(record) => record,
        Err(e) => {
            warn!("Rejected intake payload for {}: {}", account_id, e);
            return IntakeResponse::failure(StatusCode::BAD_REQUEST, "Invalid kiln request record");
        }
    };

    debug!("Intake of kiln request {} for {}", record.id, account_id);

    let queued = if state.reject_duplicates {
        state.queue_manager.enqueue_unique(&account_id, &record).await
    } else {
        state.queue_manager.enqueue(&account_id, &record).await
    };

    match queued {
        Ok(len) if len > 0 => Json(IntakeResponse {
            success: true,
            message: "Job added to queue".to_string(),
            queue_length: Some(len),
        })
        .into_response(),
        Ok(len) => {
            error!("Enqueue for {} reported queue length {}", account_id, len);
            IntakeResponse::failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to add job to queue")
        }
        Err(QueueError::Duplicate(_)) => {
            IntakeResponse::failure(StatusCode::CONFLICT, "Job already queued")
        }
        Err(e) => {
            error!("Enqueue of kiln request {} failed: {}", record.id, e);
            IntakeResponse::failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to add job to queue")
        }
    }
}

/// GET /api/health - Health check endpoint
async fn handle_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let runner = state.queue_manager.runner();

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_workers: runner.active_workers().await,
        tasks: runner.history().counts().await,
    })
}

/// GET /api/queue/:account_id - Queued jobs for one account
async fn handle_queue(
    State(state): State<ApiState>,
    Path(account_id): Path<String>,
) -> Result<Json<QueueSnapshot>> {
    let snapshot = state.queue_manager.snapshot(&account_id).await?;
    Ok(Json(snapshot))
}

/// GET /api/tasks - Background task history, newest first
async fn handle_tasks(
    State(state): State<ApiState>,
    Query(query): Query<TasksQuery>,
) -> Json<TasksResponse> {
    let limit = query.limit.unwrap_or(50).min(500);

    Json(TasksResponse {
        counts: state.queue_manager.runner().history().counts().await,
        tasks: state.queue_manager.task_history(limit).await,
    })
}

/// GET /api/metrics - Telemetry metrics (Prometheus format)
async fn handle_metrics(State(state): State<ApiState>) -> String {
    state.telemetry.export_prometheus().await
}

/// GET /api/metrics/json - Telemetry metrics (JSON format)
async fn handle_metrics_json(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let metrics = state.telemetry.get_metrics_json().await;
    let recent: Vec<_> = state
        .telemetry
        .get_event_history(20)
        .await
        .into_iter()
        .map(|(ts, event)| json!({ "ts": ts, "event": event }))
        .collect();

    Json(json!({ "metrics": metrics, "recent_events": recent }))
}

/// Create HTTP API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/webhook/add-print-job", post(handle_add_print_job))
        .route("/api/webhook/:account_id", post(handle_poll))
        .route("/api/health", get(handle_health))
        .route("/api/queue/:account_id", get(handle_queue))
        .route("/api/tasks", get(handle_tasks))
        .route("/api/metrics", get(handle_metrics))
        .route("/api/metrics/json", get(handle_metrics_json))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    // Printers poll from the studio LAN with arbitrary origins
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods([
                            axum::http::Method::GET,
                            axum::http::Method::POST,
                            axum::http::Method::OPTIONS,
                        ])
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

/// Start HTTP API server; returns once `shutdown` resolves and open requests finish
pub async fn start_api_server<F>(addr: &str, state: ApiState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state);

    info!("Starting HTTP API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            error!("HTTP API server error: {}", e);
            QueueError::Io(e)
        })
}
