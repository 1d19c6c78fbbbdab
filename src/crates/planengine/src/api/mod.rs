//! HTTP surface: everything in spec.md §6 EXTERNAL INTERFACES, plus the
//! ambient health/logging/CORS wiring every service in the pack carries.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod response;
pub mod routes;

pub use error::{ApiError, ApiErrorResponse, ApiResult};
pub use routes::{create_router, AppState};
