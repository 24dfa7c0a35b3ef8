//! HTTP adapter over [`TaskCoordinator`](crate::coordinator::TaskCoordinator).
//!
//! Authentication happens upstream: the proxy in front of this service puts
//! the verified caller id in the `x-caller-id` header and it is trusted as is.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use labelq_core::{CallerId, Item, ItemId, Label, Outcome, PromptHandle, Score};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::coordinator::{TaskError, TaskRequest};
use crate::repository::{CallerStats, CompletionOutcome, GlobalStats, ImportSummary};
use crate::AppState;

pub const CALLER_HEADER: &str = "x-caller-id";

/// Error responses. Store failures are logged and reported as 500 without
/// detail.
#[derive(Debug)]
pub enum ApiError {
    MissingCaller,
    InvalidCaller,
    NotFound,
    AlreadyCompleted,
    NotClaimed,
    Internal(TaskError),
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            ApiError::MissingCaller => (StatusCode::UNAUTHORIZED, "missing_caller"),
            ApiError::InvalidCaller => (StatusCode::UNAUTHORIZED, "invalid_caller"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::AlreadyCompleted => (StatusCode::CONFLICT, "already_completed"),
            ApiError::NotClaimed => (StatusCode::CONFLICT, "not_claimed"),
            ApiError::Internal(e) => {
                error!("Request failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        (status, Json(json!({ "error": code }))).into_response()
    }
}

/// Caller id taken from the `x-caller-id` header.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub CallerId);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(CALLER_HEADER)
            .ok_or(ApiError::MissingCaller)?;
        value
            .to_str()
            .ok()
            .and_then(|s| s.parse::<CallerId>().ok())
            .map(Caller)
            .ok_or(ApiError::InvalidCaller)
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NextTaskResponse {
    Assigned {
        item: Item,
        handle: Option<PromptHandle>,
        resumed: bool,
    },
    NoneAvailable,
}

#[derive(Debug, Deserialize)]
pub struct PresentationRequest {
    pub handle: PromptHandle,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum CompletionRequest {
    Rated { score: Score },
    Skipped,
}

impl From<CompletionRequest> for Outcome {
    fn from(request: CompletionRequest) -> Self {
        match request {
            CompletionRequest::Rated { score } => Outcome::Rated(score),
            CompletionRequest::Skipped => Outcome::Skipped,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub status: &'static str,
    pub label: Label,
}

#[derive(Debug, Deserialize)]
pub struct AddItemsRequest {
    pub texts: Vec<String>,
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "labelq"
    }))
}

async fn next_task(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
) -> Result<Json<NextTaskResponse>, ApiError> {
    let response = match state.coordinator.request_task(caller).await? {
        TaskRequest::Assigned(task) => NextTaskResponse::Assigned {
            item: task.item,
            handle: task.handle,
            resumed: task.resumed,
        },
        TaskRequest::NoneAvailable => NextTaskResponse::NoneAvailable,
    };
    Ok(Json(response))
}

async fn record_presentation(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(item_id): Path<ItemId>,
    Json(request): Json<PresentationRequest>,
) -> Result<StatusCode, ApiError> {
    if state
        .coordinator
        .record_presentation(caller, item_id, request.handle)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotClaimed)
    }
}

async fn complete_task(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(item_id): Path<ItemId>,
    Json(request): Json<CompletionRequest>,
) -> Result<Json<CompletionResponse>, ApiError> {
    match state
        .coordinator
        .complete_task(item_id, caller, request.into())
        .await?
    {
        CompletionOutcome::Completed(label) => Ok(Json(CompletionResponse {
            status: "completed",
            label,
        })),
        CompletionOutcome::AlreadyCompleted => Err(ApiError::AlreadyCompleted),
        CompletionOutcome::NotFound => Err(ApiError::NotFound),
        CompletionOutcome::NotClaimed => Err(ApiError::NotClaimed),
    }
}

async fn global_stats(State(state): State<Arc<AppState>>) -> Result<Json<GlobalStats>, ApiError> {
    Ok(Json(state.coordinator.global_stats().await?))
}

async fn caller_stats(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
) -> Result<Json<CallerStats>, ApiError> {
    Ok(Json(state.coordinator.caller_stats(caller).await?))
}

async fn add_items(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddItemsRequest>,
) -> Result<Json<ImportSummary>, ApiError> {
    Ok(Json(state.coordinator.add_items(request.texts).await?))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/tasks/next", post(next_task))
        .route("/tasks/{item_id}/presentation", put(record_presentation))
        .route("/tasks/{item_id}/completion", post(complete_task))
        .route("/stats", get(global_stats))
        .route("/stats/me", get(caller_stats))
        .route("/items", post(add_items))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
