//! API error types and their HTTP response conversion.
//!
//! Grounded on the API layer's `ApiError`: every handler error funnels
//! through [`PlanEngineError`] (rather than a database-specific error, since
//! this engine has no ORM layer of its own) and is classified into an HTTP
//! status here.

use crate::error::PlanEngineError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    pub code: String,
}

impl ApiErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>, code: impl Into<String>) -> Self {
        Self { error: error.into(), message: message.into(), code: code.into() }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("validation failed: {0}")]
    ValidationError(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal server error: {0}")]
    InternalError(String),

    #[error("task busy: {0}")]
    Busy(String),

    #[error("engine error: {0}")]
    Engine(#[from] PlanEngineError),

    #[error("json error: {0}")]
    JsonError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Busy(_) => StatusCode::CONFLICT,
            ApiError::JsonError(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(err) => match err {
                PlanEngineError::TaskNotFound(_)
                | PlanEngineError::BranchNotFound(_)
                | PlanEngineError::CommitNotFound(_) => StatusCode::NOT_FOUND,
                PlanEngineError::UnknownTool(_) => StatusCode::BAD_REQUEST,
                PlanEngineError::TaskBusy(_) => StatusCode::CONFLICT,
                PlanEngineError::CommitGraph(inner) => match inner {
                    crate::commit_graph::CommitGraphError::BranchNotFound(_)
                    | crate::commit_graph::CommitGraphError::CommitNotFound(_) => StatusCode::NOT_FOUND,
                    crate::commit_graph::CommitGraphError::LastBranch => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                },
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::ValidationError(_) => "VALIDATION_ERROR",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::InternalError(_) => "INTERNAL_ERROR",
            ApiError::Busy(_) => "TASK_BUSY",
            ApiError::JsonError(_) => "JSON_ERROR",
            ApiError::Engine(_) => match self.status_code() {
                StatusCode::NOT_FOUND => "NOT_FOUND",
                StatusCode::CONFLICT => "CONFLICT",
                StatusCode::BAD_REQUEST => "BAD_REQUEST",
                _ => "ENGINE_ERROR",
            },
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NotFound",
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::ValidationError(_) => "ValidationError",
            ApiError::Conflict(_) => "Conflict",
            ApiError::InternalError(_) => "InternalError",
            ApiError::Busy(_) => "Busy",
            ApiError::JsonError(_) => "JsonError",
            ApiError::Engine(_) => "EngineError",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ApiErrorResponse::new(self.error_type(), self.to_string(), self.code());
        tracing::error!(?status, message = %body.message, "api error");
        (status, Json(body)).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::JsonError(err.to_string())
    }
}
