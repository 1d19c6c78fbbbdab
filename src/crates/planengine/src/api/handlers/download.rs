//! `GET /api/download/{filename}`: serves a file out of the engine's
//! generated-files directory, grounded on `send_from_directory` in the
//! original — which refuses to serve outside the given directory, so the
//! filename here is rejected outright if it contains any path separator.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;

use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::AppState;

pub async fn download_file(
    State(app_state): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(ApiError::BadRequest("invalid filename".into()));
    }

    let path = std::path::Path::new(&app_state.config.generated_files_dir).join(&filename);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::NotFound(format!("file not found: {filename}")))?;

    let disposition = format!("attachment; filename=\"{filename}\"");
    Ok((
        StatusCode::OK,
        [(header::CONTENT_DISPOSITION, disposition), (header::CONTENT_TYPE, "application/octet-stream".to_string())],
        bytes,
    ))
}
