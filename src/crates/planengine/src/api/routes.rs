//! Route table, mirroring the Flask original's `api_blueprint` one-to-one
//! plus the ambient `/health` route every deployable service in the pack
//! carries.

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::api::{handlers, middleware};
use crate::config::EngineConfig;
use crate::db::DatabasePool;
use crate::task::queue::TaskQueue;
use crate::task::TaskManager;

/// Shared application state threaded through every handler via axum's
/// `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub db: DatabasePool,
    pub tasks: Arc<TaskManager>,
    pub queue: Arc<TaskQueue>,
    pub config: Arc<EngineConfig>,
}

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/health", get(handlers::health_detailed))
        .route("/api/tasks", get(handlers::list_tasks))
        .route("/api/tasks/evaluation", get(handlers::list_tasks_evaluation))
        .route("/api/best_plans", get(handlers::list_best_plans))
        .route("/api/tasks/:id", get(handlers::get_task))
        .route("/api/tasks/:id/branches", get(handlers::list_branches))
        .route("/api/tasks/:id/branches/:branch/details", get(handlers::branch_details))
        .route("/api/tasks/:id/branches/:branch/answer_detail", get(handlers::answer_detail))
        .route("/api/tasks/:id/branches/:name", delete(handlers::delete_branch))
        .route("/api/tasks/:id/commits/:hash/detail", get(handlers::commit_detail))
        .route("/api/tasks/:id/commits/:hash/diff", get(handlers::commit_diff))
        .route("/api/tasks/:id/commits/:hash/save_best_plan", post(handlers::save_best_plan))
        .route("/api/tasks/:id/set_branch", post(handlers::set_branch))
        .route("/api/tasks/:id/update", post(handlers::update_task))
        .route("/api/tasks/:id/dynamic_update", post(handlers::dynamic_update_task))
        .route("/api/tasks/:id/optimize_step", post(handlers::optimize_step))
        .route("/api/tasks/:id/re_execute", post(handlers::re_execute_task))
        .route("/api/stream_execute_vm", post(handlers::stream_execute_vm))
        .route("/api/download/:filename", get(handlers::download_file))
        .layer(middleware::cors_layer(&app_state.config.cors_allowed_origins))
        .layer(middleware::logging_layer())
        .with_state(app_state)
}
