//! Request/response DTOs for every route in [`crate::api::routes`].
//!
//! Grounded on `original_source/app/api/api_routes.py`'s JSON bodies and
//! query strings for each endpoint.

use crate::plan::Plan;
use crate::task::EvaluationStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `POST /api/stream_execute_vm` body.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamExecuteRequest {
    pub goal: String,
    #[serde(default)]
    pub response_format: Option<Value>,
    #[serde(default)]
    pub namespace_name: Option<String>,
}

/// `POST /api/tasks/{id}/update` and `.../dynamic_update` body. The latter
/// always supplies `commit_hash`; the former may instead set `from_scratch`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateTaskRequest {
    pub suggestion: String,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub from_scratch: bool,
    #[serde(default)]
    pub source_branch: Option<String>,
}

/// `POST /api/tasks/{id}/optimize_step` body.
#[derive(Debug, Clone, Deserialize)]
pub struct OptimizeStepRequest {
    pub commit_hash: String,
    pub suggestion: String,
    pub seq_no: i64,
}

/// `POST /api/tasks/{id}/re_execute` body. `plan` is the raw JSON array a
/// caller may supply to override the plan the run starts from.
#[derive(Debug, Clone, Deserialize)]
pub struct ReExecuteRequest {
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub plan: Option<Vec<crate::plan::PlanStep>>,
}

impl ReExecuteRequest {
    pub fn plan_override(&self) -> Option<Plan> {
        self.plan.clone().map(Plan::new)
    }
}

/// `POST /api/tasks/{id}/set_branch` body.
#[derive(Debug, Clone, Deserialize)]
pub struct SetBranchRequest {
    pub branch_name: String,
}

/// `GET /api/tasks` query parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

/// `GET /api/tasks/evaluation` query parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationQuery {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Comma-separated `EvaluationStatus` names, e.g. `ACCEPTED,REJECTED`.
    #[serde(default)]
    pub evaluation_status: Option<String>,
}

impl EvaluationQuery {
    pub fn parse_statuses(&self) -> Result<Option<Vec<EvaluationStatus>>, serde_json::Error> {
        let Some(raw) = &self.evaluation_status else {
            return Ok(None);
        };
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| serde_json::from_value(Value::String(s.to_string())))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

/// `GET /api/tasks/{id}/branches/{branch}/details` query: exactly one of
/// `branch` (path) or `commit_hash` (query) selects the commits returned.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitHashQuery {
    #[serde(default)]
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub version: String,
    pub timestamp: String,
}

impl HealthResponse {
    pub fn new(status: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            database: database.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_query_parses_csv_statuses() {
        let query = EvaluationQuery {
            start_time: Utc::now(),
            end_time: Utc::now(),
            evaluation_status: Some("ACCEPTED, REJECTED".to_string()),
        };
        let statuses = query.parse_statuses().unwrap().unwrap();
        assert_eq!(statuses, vec![EvaluationStatus::Accepted, EvaluationStatus::Rejected]);
    }

    #[test]
    fn evaluation_query_with_no_filter_returns_none() {
        let query = EvaluationQuery { start_time: Utc::now(), end_time: Utc::now(), evaluation_status: None };
        assert!(query.parse_statuses().unwrap().is_none());
    }
}
