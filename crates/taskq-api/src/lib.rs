//! Producer-facing HTTP API: enqueue a task, list tasks on a queue.
//!
//! An external collaborator, not part of the core engine. Translates HTTP
//! payloads into `QueueManager`/`taskq_db` calls and nothing else -- no
//! queue logic lives here.
//!
//! Uses an `AppError`/`IntoResponse` JSON-envelope pattern and the usual
//! `Router::with_state` wiring.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use taskq_core::manager::{EnqueueRequest, ManagerError, QueueManager};
use taskq_db::models::{Priority, Task, TaskStatus};
use taskq_db::queries::tasks;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl From<ManagerError> for AppError {
    fn from(err: ManagerError) -> Self {
        Self::internal(anyhow::anyhow!(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "success": false, "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Default retry/timeout values used when a producer omits them.
const DEFAULT_MAX_RETRIES: i32 = 3;
const DEFAULT_RETRY_DELAY_SECS: i64 = 5;
const DEFAULT_TIMEOUT_SECS: i64 = 300;
const DEFAULT_QUEUE_NAME: &str = "default";

/// `POST /api/tasks/` body. `priority` is accepted as a string
/// ("high"/"normal"/"low") and defaults to `normal` when omitted; args and
/// kwargs are passed through untouched, with no single-value coercion.
#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub priority: Option<String>,
    pub max_retries: Option<i32>,
    pub retry_delay_secs: Option<i64>,
    pub timeout_secs: Option<i64>,
    pub queue_name: String,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    #[serde(flatten)]
    pub task: Task,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self { task }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub queue_name: Option<String>,
    pub status: Option<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    manager: Arc<QueueManager>,
    db: sqlx::PgPool,
}

pub fn build_router(manager: Arc<QueueManager>, db: sqlx::PgPool) -> Router {
    let state = AppState { manager, db };
    Router::new()
        .route("/api/tasks/", post(enqueue_task).get(list_tasks))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_api(
    manager: Arc<QueueManager>,
    db: sqlx::PgPool,
    bind: &str,
    port: u16,
) -> anyhow::Result<()> {
    let app = build_router(manager, db);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("taskq-api listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("taskq-api shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn enqueue_task(
    State(state): State<AppState>,
    Json(body): Json<EnqueueBody>,
) -> Result<axum::response::Response, AppError> {
    if body.task_name.trim().is_empty() {
        return Err(AppError::bad_request("task_name must not be empty"));
    }
    if body.queue_name.trim().is_empty() {
        return Err(AppError::bad_request("queue_name must not be empty"));
    }

    let priority = match body.priority.as_deref() {
        Some(s) => Priority::from_str(s)
            .map_err(|e| AppError::bad_request(e.to_string()))?,
        None => Priority::default(),
    };

    let task = state
        .manager
        .enqueue(EnqueueRequest {
            task_name: body.task_name,
            args: serde_json::Value::Array(body.args),
            kwargs: serde_json::Value::Object(body.kwargs),
            priority,
            max_retries: body.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay_secs: body.retry_delay_secs.unwrap_or(DEFAULT_RETRY_DELAY_SECS),
            timeout_secs: body.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            queue_name: body.queue_name,
        })
        .await?;

    let body = serde_json::json!({ "success": true, "data": TaskResponse::from(task) });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<axum::response::Response, AppError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            TaskStatus::from_str(s).map_err(|e| AppError::bad_request(e.to_string()))?,
        ),
        None => None,
    };
    let queue_name = query.queue_name.as_deref().unwrap_or(DEFAULT_QUEUE_NAME);

    let rows = tasks::list_tasks(&state.db, queue_name, status)
        .await
        .map_err(AppError::internal)?;

    let data: Vec<TaskResponse> = rows.into_iter().map(TaskResponse::from).collect();
    let body = serde_json::json!({ "success": true, "data": data });
    Ok(Json(body).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
