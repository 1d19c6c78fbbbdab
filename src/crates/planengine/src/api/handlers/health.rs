//! `GET /api/health` handlers (spec.md §6 "Environment" implies a live
//! database; nothing in the endpoint table names a health route, but every
//! deployable HTTP service in the pack carries one).

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::api::models::HealthResponse;
use crate::api::routes::AppState;

pub async fn health() -> impl axum::response::IntoResponse {
    Json(HealthResponse::new("ok", "unknown"))
}

pub async fn health_detailed(State(app_state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match app_state.db.health_check().await {
        Ok(()) => (StatusCode::OK, Json(HealthResponse::new("ok", "connected"))),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, Json(HealthResponse::new("error", "error"))),
    }
}
