use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use shared_types::{ApiResponse, DataIsolation, Task};
use tracing::error;

use crate::error::HypervisorError;
use crate::service::{InterruptRequest, UserMessage};
use crate::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ORGANIZATION_CODE_HEADER: &str = "x-organization-code";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/topics/{topic_id}/messages", post(send_message))
        .route("/topics/{topic_id}/sandbox", post(init_sandbox))
        .route("/topics/{topic_id}/interrupt", post(interrupt))
        .route("/tasks/{task_id}", get(get_task).delete(delete_task))
        .route("/admin/reconcile", post(reconcile))
        .route("/admin/sweep", post(sweep))
        .with_state(state)
}

/// Tenant context supplied by the upstream auth layer.
pub struct Isolation(pub DataIsolation);

impl<S: Send + Sync> FromRequestParts<S> for Isolation {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let Some(user_id) = header(USER_ID_HEADER) else {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(ApiResponse::<()>::err("missing x-user-id header")),
            )
                .into_response());
        };
        let organization_code = header(ORGANIZATION_CODE_HEADER).unwrap_or_default();
        Ok(Isolation(DataIsolation::new(organization_code, user_id)))
    }
}

impl IntoResponse for HypervisorError {
    fn into_response(self) -> Response {
        let status = match &self {
            HypervisorError::NotFound { .. } => StatusCode::NOT_FOUND,
            HypervisorError::IllegalOperation(_) => StatusCode::CONFLICT,
            HypervisorError::ConcurrencyLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            HypervisorError::InterruptAckTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            e if e.is_readiness_timeout() => StatusCode::GATEWAY_TIMEOUT,
            HypervisorError::SandboxOperation { .. } | HypervisorError::Transport(_) => {
                StatusCode::BAD_GATEWAY
            }
            HypervisorError::Database(_) | HypervisorError::TaskInitFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &self {
            HypervisorError::Database(e) => {
                error!("database error: {e}");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(ApiResponse::<()>::err(message))).into_response()
    }
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Response {
    match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => Json(serde_json::json!({ "status": "ok" })).into_response(),
        Err(e) => {
            error!("health check: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}

/// POST /topics/{topic_id}/messages
async fn send_message(
    State(state): State<Arc<AppState>>,
    Isolation(isolation): Isolation,
    Path(topic_id): Path<String>,
    Json(message): Json<UserMessage>,
) -> Result<Response, HypervisorError> {
    let receipt = state
        .service
        .handle_chat_message(&isolation, &topic_id, message)
        .await?;
    Ok(Json(ApiResponse::ok(receipt)).into_response())
}

/// POST /topics/{topic_id}/sandbox creates and warms a sandbox without
/// sending the prompt
async fn init_sandbox(
    State(state): State<Arc<AppState>>,
    Isolation(isolation): Isolation,
    Path(topic_id): Path<String>,
    Json(message): Json<UserMessage>,
) -> Result<Response, HypervisorError> {
    let receipt = state
        .service
        .init_sandbox(&isolation, &topic_id, message)
        .await?;
    Ok(Json(ApiResponse::ok(receipt)).into_response())
}

/// POST /topics/{topic_id}/interrupt
async fn interrupt(
    State(state): State<Arc<AppState>>,
    Isolation(isolation): Isolation,
    Path(topic_id): Path<String>,
    Json(request): Json<InterruptRequest>,
) -> Result<Response, HypervisorError> {
    let report = state
        .service
        .handle_interrupt(&isolation, &topic_id, request)
        .await?;
    Ok(Json(ApiResponse::ok(report)).into_response())
}

async fn owned_task(
    state: &AppState,
    isolation: &DataIsolation,
    task_id: &str,
) -> Result<Task, HypervisorError> {
    state
        .service
        .lifecycle()
        .get_task_by_id(task_id)
        .await?
        .filter(|t| t.user_id == isolation.user_id)
        .ok_or_else(|| HypervisorError::not_found("task", task_id))
}

/// GET /tasks/{task_id}
async fn get_task(
    State(state): State<Arc<AppState>>,
    Isolation(isolation): Isolation,
    Path(task_id): Path<String>,
) -> Result<Response, HypervisorError> {
    let task = owned_task(&state, &isolation, &task_id).await?;
    Ok(Json(ApiResponse::ok(task)).into_response())
}

/// DELETE /tasks/{task_id}, refused while the task is running
async fn delete_task(
    State(state): State<Arc<AppState>>,
    Isolation(isolation): Isolation,
    Path(task_id): Path<String>,
) -> Result<Response, HypervisorError> {
    owned_task(&state, &isolation, &task_id).await?;
    if state.service.lifecycle().delete_task(&task_id).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Ok((
            StatusCode::CONFLICT,
            Json(ApiResponse::<()>::err("task is running")),
        )
            .into_response())
    }
}

/// POST /admin/reconcile reconciles every user with running topics
async fn reconcile(State(state): State<Arc<AppState>>) -> Result<Response, HypervisorError> {
    let running = state.reconciler.reconcile_all().await?;
    Ok(Json(ApiResponse::ok(serde_json::json!({ "running": running }))).into_response())
}

/// POST /admin/sweep runs one stale task sweep now
async fn sweep(State(state): State<Arc<AppState>>) -> Result<Response, HypervisorError> {
    let swept = state.sweeper.sweep_once(Utc::now()).await?;
    Ok(Json(ApiResponse::ok(serde_json::json!({ "swept": swept }))).into_response())
}
