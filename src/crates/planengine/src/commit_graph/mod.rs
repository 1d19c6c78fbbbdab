//! Versioned state store: a commit-graph abstraction over per-task VM
//! states, with two interchangeable back ends (spec.md §4.5).

pub mod filesystem;
pub mod relational;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommitGraphError {
    #[error("branch not found: {0}")]
    BranchNotFound(String),
    #[error("commit not found: {0}")]
    CommitNotFound(String),
    #[error("cannot delete the only remaining branch")]
    LastBranch,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CommitGraphError>;

/// Kind of a commit, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitType {
    StepExecution,
    PlanUpdate,
    StepOptimization,
    GeneratePlan,
}

/// Structured commit message, spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMessage {
    #[serde(rename = "type")]
    pub commit_type: CommitType,
    pub seq_no: Option<i64>,
    pub description: String,
    #[serde(default)]
    pub input_parameters: Value,
    #[serde(default)]
    pub output_variables: Value,
    pub execution_error: Option<String>,
}

/// An immutable, content-addressed commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub commit_hash: String,
    pub parent_hash: Option<String>,
    pub message: CommitMessage,
    pub vm_state: Value,
    pub committed_at: DateTime<Utc>,
}

/// A named, mutable pointer to a head commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub head_commit_hash: String,
    pub head_commit_time: DateTime<Utc>,
    pub message_preview: String,
    pub is_active: bool,
}

/// Human-readable difference between a commit and its parent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateDiff {
    pub additions: Vec<(String, Value)>,
    pub removals: Vec<(String, Value)>,
    pub modifications: Vec<(String, Value, Value)>,
}

/// Contract shared by the filesystem and relational back ends (spec.md
/// §4.5). Implementations are per-task: one instance owns exactly one
/// task's commits and branches.
#[async_trait]
pub trait CommitGraph: Send + Sync {
    /// Sorted with the active branch first, then by most-recent commit time
    /// descending.
    async fn list_branches(&self) -> Result<Vec<BranchInfo>>;

    /// Switch to `name`. Errors if the branch does not exist.
    async fn checkout_branch(&self, name: &str) -> Result<()>;

    /// Delete `name`. Deleting the active branch first switches to `main`
    /// (or any other available branch). Deleting the only branch fails.
    async fn delete_branch(&self, name: &str) -> Result<()>;

    /// Create branch `name` pointed at `hash` and switch to it.
    async fn checkout_branch_from_commit(&self, name: &str, hash: &str) -> Result<()>;

    async fn get_current_branch(&self) -> Result<String>;

    async fn get_current_commit_hash(&self) -> Result<String>;

    async fn get_parent_commit_hash(&self, hash: &str) -> Result<Option<String>>;

    /// Every commit hash on `branch`'s ancestry chain, head first.
    async fn get_commit_hashes(&self, branch: &str) -> Result<Vec<String>>;

    async fn get_commits(&self, branch: &str) -> Result<Vec<Commit>>;

    async fn get_commit(&self, hash: &str) -> Result<Commit>;

    async fn get_latest_commit(&self, branch: &str) -> Result<Commit>;

    async fn load_state(&self, hash: &str) -> Result<Value>;

    /// Every commit belonging to this task, regardless of which branch (if
    /// any) currently heads it. Used to rebuild the full commit tree for
    /// plan optimization, where history off the active branch still matters.
    async fn get_all_commits(&self) -> Result<Vec<Commit>>;

    /// Stage the next commit's snapshot (not yet written).
    async fn update_state(&self, vm_state: Value) -> Result<()>;

    /// Write the staged state as a new commit on the current branch. If no
    /// state has been staged since the last commit, returns the current
    /// head without writing anything.
    async fn commit_changes(&self, message: CommitMessage) -> Result<String>;

    async fn get_state_diff(&self, hash: &str) -> Result<StateDiff>;
}

fn diff_state(parent: &Value, child: &Value) -> StateDiff {
    let mut diff = StateDiff::default();
    let (Some(parent_map), Some(child_map)) = (parent.as_object(), child.as_object()) else {
        return diff;
    };
    for (key, child_value) in child_map {
        match parent_map.get(key) {
            None => diff.additions.push((key.clone(), child_value.clone())),
            Some(parent_value) if parent_value != child_value => {
                diff.modifications.push((key.clone(), parent_value.clone(), child_value.clone()))
            }
            _ => {}
        }
    }
    for (key, parent_value) in parent_map {
        if !child_map.contains_key(key) {
            diff.removals.push((key.clone(), parent_value.clone()));
        }
    }
    diff
}

fn message_preview(message: &CommitMessage, max_len: usize) -> String {
    let mut s = message.description.clone();
    if s.len() > max_len {
        s.truncate(max_len);
        s.push('\u{2026}');
    }
    s
}
