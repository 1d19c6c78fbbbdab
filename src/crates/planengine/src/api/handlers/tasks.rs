//! Task listing/detail and plan-mutation handlers.

use axum::extract::{Path, Query, State};
use axum::Json;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    EvaluationQuery, OptimizeStepRequest, PaginationQuery, ReExecuteRequest, UpdateTaskRequest,
};
use crate::api::response;
use crate::api::routes::AppState;
use chrono::Utc;

/// `GET /api/tasks`
pub async fn list_tasks(
    State(app_state): State<AppState>,
    Query(query): Query<PaginationQuery>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let tasks = app_state.tasks.list_tasks(query.limit, query.offset).await?;
    Ok(response::ok(tasks))
}

/// `GET /api/tasks/{id}`
pub async fn get_task(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let task = app_state.tasks.get_task(id).await?;
    Ok(response::ok(task.snapshot().await))
}

/// `GET /api/tasks/evaluation`
pub async fn list_tasks_evaluation(
    State(app_state): State<AppState>,
    Query(query): Query<EvaluationQuery>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let statuses = query.parse_statuses().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let tasks = app_state
        .tasks
        .list_tasks_evaluation(query.start_time, query.end_time, statuses.as_deref())
        .await?;
    Ok(response::ok(tasks))
}

/// `GET /api/best_plans`
pub async fn list_best_plans(
    State(app_state): State<AppState>,
    Query(query): Query<PaginationQuery>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let plans = app_state.tasks.list_best_plans(query.limit, query.offset).await?;
    let total = app_state.tasks.count_best_plans().await?;
    Ok(response::paginated(plans, query.limit, query.offset, total))
}

/// `POST /api/tasks/{id}/update`. Runs in the background through the task
/// queue, same as the Flask original's `ts.task_queue.add_task(...)`: the
/// response acknowledges the branch that will be updated, not the outcome.
pub async fn update_task(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTaskRequest>,
) -> ApiResult<impl axum::response::IntoResponse> {
    if req.suggestion.trim().is_empty() {
        return Err(ApiError::ValidationError("suggestion must not be empty".into()));
    }
    let task = app_state.tasks.get_task(id).await?;
    let branch_name = format!("update_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let current_branch = branch_name.clone();
    app_state.queue.add_task(id, async move {
        task.update(branch_name, req.commit_hash, req.suggestion, req.from_scratch, req.source_branch)
            .await
            .map(|_| ())
            .map_err(anyhow::Error::from)
    });
    Ok(response::ok(serde_json::json!({"success": true, "current_branch": current_branch})))
}

/// `POST /api/tasks/{id}/dynamic_update` — the Python original's "variant of
/// update" that always targets an explicit `commit_hash` rather than
/// optionally replaying from scratch. Also queued, not awaited inline.
pub async fn dynamic_update_task(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTaskRequest>,
) -> ApiResult<impl axum::response::IntoResponse> {
    if req.commit_hash.is_none() {
        return Err(ApiError::ValidationError("commit_hash is required".into()));
    }
    let task = app_state.tasks.get_task(id).await?;
    let branch_name = format!("dynamic_update_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let current_branch = branch_name.clone();
    app_state.queue.add_task(id, async move {
        task.update(branch_name, req.commit_hash, req.suggestion, false, None).await.map(|_| ()).map_err(anyhow::Error::from)
    });
    Ok(response::ok(serde_json::json!({"success": true, "current_branch": current_branch})))
}

/// `POST /api/tasks/{id}/optimize_step`
pub async fn optimize_step(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<OptimizeStepRequest>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let task = app_state.tasks.get_task(id).await?;
    let outcome = task.optimize_step(req.commit_hash, req.seq_no, req.suggestion).await?;
    Ok(response::ok(outcome))
}

/// `POST /api/tasks/{id}/re_execute`
pub async fn re_execute_task(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReExecuteRequest>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let task = app_state.tasks.get_task(id).await?;
    let plan_override = req.plan_override();
    let outcome = task.re_execute(req.reasoning.clone(), req.commit_hash.clone(), plan_override).await?;
    Ok(response::ok(outcome))
}

/// `POST /api/tasks/{id}/commits/{hash}/save_best_plan`
pub async fn save_best_plan(
    State(app_state): State<AppState>,
    Path((id, commit_hash)): Path<(Uuid, String)>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let task = app_state.tasks.get_task(id).await?;
    task.save_best_plan(&commit_hash).await?;
    Ok(response::ok(serde_json::json!({"success": true})))
}
