//! Owner API for schedule items: `/items` and `/items/{id}/...`.
//!
//! Every handler returns `{ "item": ... }` (or a collection) on success and
//! `{ "error", "code" }` with a matching HTTP status on failure.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use cadence_core::{CoreError, ItemId, OwnerId};
use cadence_scheduler::{ItemFilter, ItemStatus, ItemUpdate, NewItem, SchedulerError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

const DEFAULT_DUE_LIMIT: u32 = 100;

/// Map a scheduler error to an HTTP status and JSON body.
fn api_error(e: SchedulerError) -> (StatusCode, Json<Value>) {
    let e = CoreError::from(e);
    let status = match &e {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(code = e.code(), "request failed: {e}");
    }
    (status, Json(json!({"error": e.to_string(), "code": e.code()})))
}

fn bad_request(message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message, "code": "VALIDATION_ERROR"})),
    )
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub owner_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DueQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub owner_id: Option<String>,
}

/// POST /items
pub async fn create_item(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewItem>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let item = state.scheduler.create(req).map_err(api_error)?;
    info!(item_id = %item.id, owner_id = %item.owner_id, "item created via HTTP");
    Ok((StatusCode::CREATED, Json(json!({"item": item}))))
}

/// GET /items?owner_id=&status=
pub async fn list_items(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> ApiResult {
    let status = q
        .status
        .as_deref()
        .map(str::parse::<ItemStatus>)
        .transpose()
        .map_err(bad_request)?;
    let filter = ItemFilter {
        owner_id: q.owner_id.map(OwnerId::from),
        status,
    };
    let items = state.scheduler.list(&filter).map_err(api_error)?;
    Ok(Json(json!({"count": items.len(), "items": items})))
}

/// GET /items/due?limit=
pub async fn due_items(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DueQuery>,
) -> ApiResult {
    let items = state
        .scheduler
        .due(q.limit.unwrap_or(DEFAULT_DUE_LIMIT))
        .map_err(api_error)?;
    Ok(Json(json!({"count": items.len(), "items": items})))
}

/// GET /items/stats?owner_id=
pub async fn item_stats(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult {
    let owner = q.owner_id.map(OwnerId::from);
    let stats = state
        .scheduler
        .stats(owner.as_ref())
        .map_err(api_error)?;
    Ok(Json(json!({"stats": stats})))
}

/// GET /items/{id}
pub async fn get_item(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let item = state.scheduler.get(&ItemId::from(id)).map_err(api_error)?;
    Ok(Json(json!({"item": item})))
}

/// PATCH /items/{id}
pub async fn update_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<ItemUpdate>,
) -> ApiResult {
    let item = state
        .scheduler
        .update(&ItemId::from(id), update)
        .map_err(api_error)?;
    Ok(Json(json!({"item": item})))
}

/// DELETE /items/{id}
pub async fn delete_item(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let id = ItemId::from(id);
    state.scheduler.delete(&id).map_err(api_error)?;
    Ok(Json(json!({"deleted": id})))
}

/// POST /items/{id}/activate
pub async fn activate_item(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let item = state
        .scheduler
        .activate(&ItemId::from(id))
        .map_err(api_error)?;
    Ok(Json(json!({"item": item})))
}

/// POST /items/{id}/pause
pub async fn pause_item(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let item = state.scheduler.pause(&ItemId::from(id)).map_err(api_error)?;
    Ok(Json(json!({"item": item})))
}

/// POST /items/{id}/cancel
pub async fn cancel_item(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let item = state.scheduler.cancel(&ItemId::from(id)).map_err(api_error)?;
    Ok(Json(json!({"item": item})))
}

/// POST /items/{id}/retry
pub async fn retry_item(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let item = state.scheduler.retry(&ItemId::from(id)).map_err(api_error)?;
    Ok(Json(json!({"item": item})))
}

/// POST /items/{id}/send-now. Answers 202; the item is queued, not yet published.
pub async fn send_now(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let item = state
        .scheduler
        .send_now(&ItemId::from(id))
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(json!({"item": item}))))
}

/// GET /items/{id}/attempts
pub async fn item_attempts(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let attempts = state
        .scheduler
        .attempts(&ItemId::from(id))
        .map_err(api_error)?;
    Ok(Json(json!({"count": attempts.len(), "attempts": attempts})))
}
