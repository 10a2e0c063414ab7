//! Flow CRUD and lifecycle handlers for the REST API.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use uuid::Uuid;

use dripline_types::flow::{FlowDefinition, FlowStats, FlowStatus, MessageTemplate};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Query parameters for listing flows.
#[derive(Debug, Deserialize)]
pub struct ListFlowsQuery {
    /// Optional status filter (draft, active, archived).
    pub status: Option<FlowStatus>,
}

/// POST /api/v1/flows - Save a new flow definition (starts as Draft).
pub async fn create_flow(
    State(state): State<AppState>,
    Json(body): Json<FlowDefinition>,
) -> Result<ApiResponse<FlowDefinition>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let saved = state.flow_service.save(body).await?;
    Ok(ApiResponse::success(
        saved,
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// GET /api/v1/flows - List flow definitions.
pub async fn list_flows(
    State(state): State<AppState>,
    Query(query): Query<ListFlowsQuery>,
) -> Result<ApiResponse<Vec<FlowDefinition>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let flows = state.flow_service.list(query.status).await?;
    Ok(ApiResponse::success(
        flows,
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// GET /api/v1/flows/:id - Get a flow definition by id.
pub async fn get_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<FlowDefinition>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let flow = state.flow_service.get(&id).await?;
    Ok(ApiResponse::success(
        flow,
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// PUT /api/v1/flows/:id - Update a flow definition.
pub async fn update_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(mut body): Json<FlowDefinition>,
) -> Result<ApiResponse<FlowDefinition>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    body.id = id;
    let saved = state.flow_service.save(body).await?;
    Ok(ApiResponse::success(
        saved,
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// DELETE /api/v1/flows/:id - Delete a flow definition.
pub async fn delete_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.flow_service.delete(&id).await?;
    Ok(ApiResponse::success(
        serde_json::json!({ "deleted": true }),
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// POST /api/v1/flows/:id/activate - Validate and activate a flow.
pub async fn activate_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<FlowDefinition>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let flow = state.flow_service.activate(&id).await?;
    Ok(ApiResponse::success(
        flow,
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// POST /api/v1/flows/:id/archive - Archive a flow (triggers stop firing).
pub async fn archive_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.flow_service.archive(&id).await?;
    Ok(ApiResponse::success(
        serde_json::json!({ "archived": true }),
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// GET /api/v1/flows/:id/stats - Per-flow aggregate counters.
pub async fn flow_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<Option<FlowStats>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let stats = state.enrollment_service.stats(&id).await?;
    Ok(ApiResponse::success(
        stats,
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// POST /api/v1/templates - Save a message template.
pub async fn create_template(
    State(state): State<AppState>,
    Json(body): Json<MessageTemplate>,
) -> Result<ApiResponse<MessageTemplate>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.flow_service.save_template(&body).await?;
    Ok(ApiResponse::success(
        body,
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// GET /api/v1/templates/:id - Get a message template.
pub async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<MessageTemplate>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let template = state.flow_service.get_template(&id).await?;
    Ok(ApiResponse::success(
        template,
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}
