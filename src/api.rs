use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app::task_names;
use crate::metrics::Metrics;
use crate::models::{NewsSource, Post, PostStatus, Stats};
use crate::store::Store;
use crate::tasks::{DispatchError, WorkerPool};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub pool: Arc<WorkerPool>,
}

/// Operator surface: health, counters, manual triggers, `/metrics`.
pub fn router(state: AppState, metrics: &Metrics) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/stats", get(stats))
        .route("/posts", get(list_posts))
        .route("/posts/publish", post(publish_posts))
        .route("/posts/retry-failed", post(retry_failed))
        .route("/sources", get(list_sources))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{name}", post(run_task))
        .with_state(state)
        .merge(metrics.router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(e: crate::store::StoreError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        let status = match e {
            DispatchError::UnknownTask(_) => StatusCode::NOT_FOUND,
            DispatchError::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(status = %self.status, error = %self.message, "api error");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn stats(State(state): State<AppState>) -> ApiResult<Json<Stats>> {
    Ok(Json(state.store.stats().await?))
}

#[derive(Deserialize)]
struct PostsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn list_posts(
    State(state): State<AppState>,
    Query(q): Query<PostsQuery>,
) -> ApiResult<Json<Vec<Post>>> {
    let status: PostStatus = q
        .status
        .as_deref()
        .unwrap_or("draft")
        .parse()
        .map_err(|e: anyhow::Error| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    let posts = state
        .store
        .posts_by_status(status, q.offset.unwrap_or(0).max(0), q.limit.unwrap_or(100).clamp(1, 500))
        .await?;
    Ok(Json(posts))
}

async fn list_sources(State(state): State<AppState>) -> ApiResult<Json<Vec<NewsSource>>> {
    Ok(Json(state.store.list_sources().await?))
}

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(
        state
            .pool
            .registry()
            .names()
            .into_iter()
            .map(String::from)
            .collect(),
    )
}

#[derive(Deserialize)]
struct PublishQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn publish_posts(
    State(state): State<AppState>,
    Query(q): Query<PublishQuery>,
) -> ApiResult<Json<Value>> {
    let args = match q.limit {
        Some(limit) => json!({ "limit": limit }),
        None => Value::Null,
    };
    let ticket = state.pool.dispatch(task_names::PUBLISH_DRAFTS, args).await?;
    Ok(Json(ticket.wait().await?))
}

async fn retry_failed(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let ticket = state.pool.dispatch(task_names::RETRY_FAILED, Value::Null).await?;
    Ok(Json(ticket.wait().await?))
}

#[derive(Deserialize)]
struct TaskQuery {
    #[serde(default)]
    wait: bool,
}

/// Queue a task. Body (optional) is the JSON argument object. Returns 202
/// with the ticket id, or the task result with `?wait=true`.
async fn run_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<TaskQuery>,
    body: Bytes,
) -> ApiResult<Response> {
    let args: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")))?
    };
    let ticket = state.pool.dispatch(&name, args).await?;
    if q.wait {
        let out = ticket.wait().await?;
        return Ok(Json(json!({ "task": name, "result": out })).into_response());
    }
    let id = ticket.id;
    tokio::spawn(async move {
        if let Err(e) = ticket.wait().await {
            tracing::warn!(task = %name, %id, error = %format!("{e:#}"), "queued task failed");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id, "status": "queued" }))).into_response())
}
