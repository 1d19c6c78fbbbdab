//! Branch and commit inspection handlers.

use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::api::models::SetBranchRequest;
use crate::api::response;
use crate::api::routes::AppState;

/// `GET /api/tasks/{id}/branches`
pub async fn list_branches(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let task = app_state.tasks.get_task(id).await?;
    let branches = task.list_branches().await?;
    Ok(response::ok(branches))
}

/// `GET /api/tasks/{id}/branches/{branch}/details`
pub async fn branch_details(
    State(app_state): State<AppState>,
    Path((id, branch)): Path<(Uuid, String)>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let task = app_state.tasks.get_task(id).await?;
    let commits = task.get_execution_details(Some(&branch), None).await?;
    Ok(response::ok(commits))
}

/// `GET /api/tasks/{id}/branches/{branch}/answer_detail`
pub async fn answer_detail(
    State(app_state): State<AppState>,
    Path((id, branch)): Path<(Uuid, String)>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let task = app_state.tasks.get_task(id).await?;
    let commit = task.get_answer_detail(&branch).await?;
    Ok(response::ok(serde_json::json!({
        "task": task.snapshot().await,
        "commit": commit,
    })))
}

/// `GET /api/tasks/{id}/commits/{hash}/detail`
pub async fn commit_detail(
    State(app_state): State<AppState>,
    Path((id, hash)): Path<(Uuid, String)>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let task = app_state.tasks.get_task(id).await?;
    let commit = task
        .get_execution_details(None, Some(&hash))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| crate::api::error::ApiError::NotFound(format!("commit not found: {hash}")))?;
    Ok(response::ok(commit))
}

/// `GET /api/tasks/{id}/commits/{hash}/diff`
pub async fn commit_diff(
    State(app_state): State<AppState>,
    Path((id, hash)): Path<(Uuid, String)>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let task = app_state.tasks.get_task(id).await?;
    let diff = task.get_state_diff(&hash).await?;
    Ok(response::ok(diff))
}

/// `POST /api/tasks/{id}/set_branch`. The Python original's own git-backed
/// checkout logic is dead code ("Deprecated Code to remove later") left
/// commented out in the view; this mirrors the view as it actually runs
/// today, an acknowledgement rather than a real checkout.
pub async fn set_branch(Path(_id): Path<Uuid>, Json(_req): Json<SetBranchRequest>) -> impl axum::response::IntoResponse {
    response::ok(serde_json::json!({"success": true}))
}

/// `DELETE /api/tasks/{id}/branches/{name}`
pub async fn delete_branch(
    State(app_state): State<AppState>,
    Path((id, name)): Path<(Uuid, String)>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let task = app_state.tasks.get_task(id).await?;
    task.delete_branch(&name).await?;
    Ok(response::no_content())
}
