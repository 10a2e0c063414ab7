//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`. Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Flow CRUD and lifecycle
        .route(
            "/flows",
            post(handlers::flow::create_flow).get(handlers::flow::list_flows),
        )
        .route(
            "/flows/{id}",
            get(handlers::flow::get_flow)
                .put(handlers::flow::update_flow)
                .delete(handlers::flow::delete_flow),
        )
        .route("/flows/{id}/activate", post(handlers::flow::activate_flow))
        .route("/flows/{id}/archive", post(handlers::flow::archive_flow))
        .route("/flows/{id}/stats", get(handlers::flow::flow_stats))
        // Enrollment administration
        .route(
            "/flows/{id}/enrollments",
            post(handlers::enrollment::enroll).get(handlers::enrollment::list_enrollments),
        )
        .route(
            "/flows/{id}/enrollments/bulk",
            post(handlers::enrollment::bulk_enroll),
        )
        .route(
            "/enrollments/{id}",
            get(handlers::enrollment::get_enrollment)
                .delete(handlers::enrollment::remove_enrollment),
        )
        .route(
            "/enrollments/{id}/pause",
            post(handlers::enrollment::pause_enrollment),
        )
        .route(
            "/enrollments/{id}/resume",
            post(handlers::enrollment::resume_enrollment),
        )
        .route(
            "/enrollments/{id}/events",
            get(handlers::enrollment::list_events),
        )
        // Message templates
        .route("/templates", post(handlers::flow::create_template))
        .route("/templates/{id}", get(handlers::flow::get_template));

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
