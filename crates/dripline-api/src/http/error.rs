//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use dripline_core::service::enrollment::EnrollmentServiceError;
use dripline_core::service::flow::FlowServiceError;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Flow administration errors.
    Flow(FlowServiceError),
    /// Enrollment administration errors.
    Enrollment(EnrollmentServiceError),
    /// Request validation error.
    Validation(String),
    /// Generic internal error.
    Internal(String),
}

impl From<FlowServiceError> for AppError {
    fn from(e: FlowServiceError) -> Self {
        AppError::Flow(e)
    }
}

impl From<EnrollmentServiceError> for AppError {
    fn from(e: EnrollmentServiceError) -> Self {
        AppError::Enrollment(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Flow(FlowServiceError::NotFound) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", "Flow not found".to_string())
            }
            AppError::Flow(FlowServiceError::Invalid(e)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
            }
            AppError::Flow(FlowServiceError::Conflict(msg)) => {
                (StatusCode::CONFLICT, "CONFLICT", msg.clone())
            }
            AppError::Flow(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "FLOW_ERROR", e.to_string())
            }
            AppError::Enrollment(EnrollmentServiceError::NotFound) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "Enrollment not found".to_string(),
            ),
            AppError::Enrollment(EnrollmentServiceError::FlowNotFound) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", "Flow not found".to_string())
            }
            AppError::Enrollment(EnrollmentServiceError::SubjectNotFound) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "Subject not found".to_string(),
            ),
            AppError::Enrollment(EnrollmentServiceError::FlowNotActive) => (
                StatusCode::CONFLICT,
                "CONFLICT",
                "Flow is not active".to_string(),
            ),
            AppError::Enrollment(EnrollmentServiceError::InvalidTransition(_)) => (
                StatusCode::CONFLICT,
                "CONFLICT",
                self.detail(),
            ),
            AppError::Enrollment(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ENROLLMENT_ERROR",
                e.to_string(),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone()),
        };

        let body = json!({
            "data": null,
            "meta": {
                "request_id": "",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "response_time_ms": 0
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl AppError {
    fn detail(&self) -> String {
        match self {
            AppError::Flow(e) => e.to_string(),
            AppError::Enrollment(e) => e.to_string(),
            AppError::Validation(msg) | AppError::Internal(msg) => msg.clone(),
        }
    }
}
