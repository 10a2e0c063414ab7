//! Enrollment administration handlers: the thin CRUD surface the UI layer
//! consumes.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dripline_core::service::enrollment::BulkEnrollOutcome;
use dripline_types::enrollment::{Enrollment, EnrollmentEvent};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub subject_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct BulkEnrollRequest {
    pub subject_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct EnrollResponse {
    pub enrollment: Enrollment,
    /// False when the subject was already enrolled (idempotent create).
    pub created: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/flows/:id/enrollments - Manually enroll one subject.
pub async fn enroll(
    State(state): State<AppState>,
    Path(flow_id): Path<Uuid>,
    Json(body): Json<EnrollRequest>,
) -> Result<ApiResponse<EnrollResponse>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let (enrollment, created) = state
        .enrollment_service
        .enroll(&flow_id, &body.subject_id)
        .await?;
    Ok(ApiResponse::success(
        EnrollResponse {
            enrollment,
            created,
        },
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// POST /api/v1/flows/:id/enrollments/bulk - Enroll many subjects.
pub async fn bulk_enroll(
    State(state): State<AppState>,
    Path(flow_id): Path<Uuid>,
    Json(body): Json<BulkEnrollRequest>,
) -> Result<ApiResponse<BulkEnrollOutcome>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    if body.subject_ids.is_empty() {
        return Err(AppError::Validation("subject_ids must not be empty".to_string()));
    }

    let outcome = state
        .enrollment_service
        .bulk_enroll(&flow_id, &body.subject_ids)
        .await?;
    Ok(ApiResponse::success(
        outcome,
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// GET /api/v1/flows/:id/enrollments - Status/position for a flow's
/// enrollments.
pub async fn list_enrollments(
    State(state): State<AppState>,
    Path(flow_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> Result<ApiResponse<Vec<Enrollment>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let enrollments = state
        .enrollment_service
        .list_by_flow(&flow_id, query.limit)
        .await?;
    Ok(ApiResponse::success(
        enrollments,
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// GET /api/v1/enrollments/:id - One enrollment's current state.
pub async fn get_enrollment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<Enrollment>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let enrollment = state.enrollment_service.get(&id).await?;
    Ok(ApiResponse::success(
        enrollment,
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// POST /api/v1/enrollments/:id/pause
pub async fn pause_enrollment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.enrollment_service.pause(&id).await?;
    Ok(ApiResponse::success(
        serde_json::json!({ "paused": true }),
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// POST /api/v1/enrollments/:id/resume
pub async fn resume_enrollment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.enrollment_service.resume(&id).await?;
    Ok(ApiResponse::success(
        serde_json::json!({ "resumed": true }),
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// DELETE /api/v1/enrollments/:id
pub async fn remove_enrollment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.enrollment_service.remove(&id).await?;
    Ok(ApiResponse::success(
        serde_json::json!({ "removed": true }),
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// GET /api/v1/enrollments/:id/events - The enrollment's audit trail.
pub async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<Vec<EnrollmentEvent>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let events = state.enrollment_service.events(&id).await?;
    Ok(ApiResponse::success(
        events,
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}
