//! Response helpers: consistent envelopes for success, error, and
//! paginated JSON bodies.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self { success: true, data }
    }
}

pub fn ok<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::OK, Json(SuccessResponse::new(data)))
}

pub fn no_content() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
}

impl<T: Serialize> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, limit: i64, offset: i64, total: i64) -> Self {
        Self { data, limit, offset, total }
    }
}

pub fn paginated<T: Serialize>(data: Vec<T>, limit: i64, offset: i64, total: i64) -> impl IntoResponse {
    (StatusCode::OK, Json(PaginatedResponse::new(data, limit, offset, total)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paginated_response_carries_total_independent_of_page_size() {
        let resp = PaginatedResponse::new(vec![1, 2], 10, 0, 37);
        assert_eq!(resp.total, 37);
        assert_eq!(resp.data.len(), 2);
    }
}
