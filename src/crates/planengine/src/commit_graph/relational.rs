//! Relational commit graph back end: the same DAG expressed over `commits`
//! and `branches` tables (spec.md §4.5, §6).
//!
//! Grounded on `original_source/app/services/mysql_branch_manager.py`: a
//! task with zero commits synthesizes an initial empty commit and a `main`
//! branch on first use; `commit_changes` inserts the commit and updates the
//! branch head in one transaction.

use super::{diff_state, message_preview, BranchInfo, Commit, CommitGraph, CommitGraphError, CommitMessage, CommitType, Result, StateDiff};
use crate::db::DatabasePool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::Row;
use tokio::sync::Mutex;

const MESSAGE_PREVIEW_LEN: usize = 50;
const MAIN_BRANCH: &str = "main";

pub struct RelationalCommitGraph {
    db: DatabasePool,
    task_id: String,
    staged: Mutex<Option<Value>>,
}

impl RelationalCommitGraph {
    pub async fn open(db: DatabasePool, task_id: impl Into<String>) -> Result<Self> {
        let task_id = task_id.into();
        let graph = Self { db, task_id, staged: Mutex::new(None) };
        graph.ensure_seeded().await?;
        Ok(graph)
    }

    async fn ensure_seeded(&self) -> Result<()> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM branches WHERE task_id = ?")
            .bind(&self.task_id)
            .fetch_one(self.db.raw())
            .await?;
        if count > 0 {
            return Ok(());
        }

        let message = CommitMessage {
            commit_type: CommitType::GeneratePlan,
            seq_no: None,
            description: "initial state".into(),
            input_parameters: Value::Null,
            output_variables: Value::Null,
            execution_error: None,
        };
        let state = Value::Object(Default::default());
        let hash = content_hash(&None, &message, &state);
        let now = Utc::now();

        let mut tx = self.db.raw().begin().await?;
        sqlx::query(
            "INSERT INTO commits (commit_hash, parent_hash, task_id, message, vm_state, committed_at) VALUES (?, NULL, ?, ?, ?, ?)",
        )
        .bind(&hash)
        .bind(&self.task_id)
        .bind(serde_json::to_string(&message)?)
        .bind(serde_json::to_string(&state)?)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO branches (name, task_id, head_commit_hash) VALUES (?, ?, ?)")
            .bind(MAIN_BRANCH)
            .bind(&self.task_id)
            .bind(&hash)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO task_active_branch (task_id, branch_name) VALUES (?, ?)
             ON CONFLICT(task_id) DO UPDATE SET branch_name = excluded.branch_name",
        )
        .bind(&self.task_id)
        .bind(MAIN_BRANCH)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn head_hash(&self, branch: &str) -> Result<String> {
        let row = sqlx::query(
            "SELECT head_commit_hash FROM branches WHERE task_id = ? AND name = ?",
        )
        .bind(&self.task_id)
        .bind(branch)
        .fetch_optional(self.db.raw())
        .await?;
        row.map(|r| r.get::<String, _>("head_commit_hash"))
            .ok_or_else(|| CommitGraphError::BranchNotFound(branch.to_string()))
    }

    async fn read_commit(&self, hash: &str) -> Result<Commit> {
        let row = sqlx::query(
            "SELECT commit_hash, parent_hash, message, vm_state, committed_at FROM commits WHERE task_id = ? AND commit_hash = ?",
        )
        .bind(&self.task_id)
        .bind(hash)
        .fetch_optional(self.db.raw())
        .await?
        .ok_or_else(|| CommitGraphError::CommitNotFound(hash.to_string()))?;

        row_to_commit(row)
    }

    async fn branch_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM branches WHERE task_id = ?")
            .bind(&self.task_id)
            .fetch_all(self.db.raw())
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("name")).collect())
    }
}

fn row_to_commit(row: sqlx::sqlite::SqliteRow) -> Result<Commit> {
    let message: CommitMessage = serde_json::from_str(row.get::<String, _>("message").as_str())?;
    let vm_state: Value = serde_json::from_str(row.get::<String, _>("vm_state").as_str())?;
    let committed_at: DateTime<Utc> = row
        .get::<String, _>("committed_at")
        .parse()
        .map_err(|_| CommitGraphError::Other("invalid committed_at timestamp".into()))?;
    Ok(Commit {
        commit_hash: row.get("commit_hash"),
        parent_hash: row.get("parent_hash"),
        message,
        vm_state,
        committed_at,
    })
}

fn content_hash(parent: &Option<String>, message: &CommitMessage, state: &Value) -> String {
    let canonical = serde_json::json!({ "parent": parent, "message": message, "state": state });
    let stable = tooling::serialization::to_stable_json(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(stable.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl CommitGraph for RelationalCommitGraph {
    async fn list_branches(&self) -> Result<Vec<BranchInfo>> {
        let active = self.get_current_branch().await?;
        let names = self.branch_names().await?;
        let mut infos = Vec::new();
        for name in names {
            let hash = self.head_hash(&name).await?;
            let commit = self.read_commit(&hash).await?;
            infos.push(BranchInfo {
                name: name.clone(),
                head_commit_hash: hash,
                head_commit_time: commit.committed_at,
                message_preview: message_preview(&commit.message, MESSAGE_PREVIEW_LEN),
                is_active: name == active,
            });
        }
        infos.sort_by(|a, b| match (a.is_active, b.is_active) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => b.head_commit_time.cmp(&a.head_commit_time),
        });
        Ok(infos)
    }

    async fn checkout_branch(&self, name: &str) -> Result<()> {
        self.head_hash(name).await?;
        sqlx::query(
            "INSERT INTO task_active_branch (task_id, branch_name) VALUES (?, ?)
             ON CONFLICT(task_id) DO UPDATE SET branch_name = excluded.branch_name",
        )
        .bind(&self.task_id)
        .bind(name)
        .execute(self.db.raw())
        .await?;
        Ok(())
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        let names = self.branch_names().await?;
        if names.len() <= 1 {
            return Err(CommitGraphError::LastBranch);
        }
        if !names.iter().any(|n| n == name) {
            return Err(CommitGraphError::BranchNotFound(name.to_string()));
        }

        let active = self.get_current_branch().await?;
        if active == name {
            let fallback = names
                .iter()
                .find(|n| n.as_str() == MAIN_BRANCH && n.as_str() != name)
                .or_else(|| names.iter().find(|n| n.as_str() != name))
                .cloned()
                .expect("at least one other branch exists");
            self.checkout_branch(&fallback).await?;
        }

        sqlx::query("DELETE FROM branches WHERE task_id = ? AND name = ?")
            .bind(&self.task_id)
            .bind(name)
            .execute(self.db.raw())
            .await?;
        Ok(())
    }

    async fn checkout_branch_from_commit(&self, name: &str, hash: &str) -> Result<()> {
        self.read_commit(hash).await?;
        sqlx::query(
            "INSERT INTO branches (name, task_id, head_commit_hash) VALUES (?, ?, ?)
             ON CONFLICT(name, task_id) DO UPDATE SET head_commit_hash = excluded.head_commit_hash",
        )
        .bind(name)
        .bind(&self.task_id)
        .bind(hash)
        .execute(self.db.raw())
        .await?;
        self.checkout_branch(name).await
    }

    async fn get_current_branch(&self) -> Result<String> {
        let row = sqlx::query("SELECT branch_name FROM task_active_branch WHERE task_id = ?")
            .bind(&self.task_id)
            .fetch_optional(self.db.raw())
            .await?;
        Ok(row
            .map(|r| r.get::<String, _>("branch_name"))
            .unwrap_or_else(|| MAIN_BRANCH.to_string()))
    }

    async fn get_current_commit_hash(&self) -> Result<String> {
        let branch = self.get_current_branch().await?;
        self.head_hash(&branch).await
    }

    async fn get_parent_commit_hash(&self, hash: &str) -> Result<Option<String>> {
        Ok(self.read_commit(hash).await?.parent_hash)
    }

    async fn get_commit_hashes(&self, branch: &str) -> Result<Vec<String>> {
        let mut hash = self.head_hash(branch).await?;
        let mut out = Vec::new();
        loop {
            out.push(hash.clone());
            match self.read_commit(&hash).await?.parent_hash {
                Some(parent) => hash = parent,
                None => break,
            }
        }
        Ok(out)
    }

    async fn get_commits(&self, branch: &str) -> Result<Vec<Commit>> {
        let hashes = self.get_commit_hashes(branch).await?;
        let mut commits = Vec::with_capacity(hashes.len());
        for hash in hashes {
            commits.push(self.read_commit(&hash).await?);
        }
        Ok(commits)
    }

    async fn get_commit(&self, hash: &str) -> Result<Commit> {
        self.read_commit(hash).await
    }

    async fn get_latest_commit(&self, branch: &str) -> Result<Commit> {
        let hash = self.head_hash(branch).await?;
        self.read_commit(&hash).await
    }

    async fn load_state(&self, hash: &str) -> Result<Value> {
        Ok(self.read_commit(hash).await?.vm_state)
    }

    async fn get_all_commits(&self) -> Result<Vec<Commit>> {
        let rows = sqlx::query(
            "SELECT commit_hash, parent_hash, message, vm_state, committed_at FROM commits WHERE task_id = ?",
        )
        .bind(&self.task_id)
        .fetch_all(self.db.raw())
        .await?;
        rows.into_iter().map(row_to_commit).collect()
    }

    async fn update_state(&self, vm_state: Value) -> Result<()> {
        *self.staged.lock().await = Some(vm_state);
        Ok(())
    }

    async fn commit_changes(&self, message: CommitMessage) -> Result<String> {
        let branch = self.get_current_branch().await?;
        let parent_hash = self.head_hash(&branch).await?;

        let staged = self.staged.lock().await.take();
        let Some(staged) = staged else {
            return Ok(parent_hash);
        };

        let parent_commit = self.read_commit(&parent_hash).await?;
        if parent_commit.vm_state == staged {
            return Ok(parent_hash);
        }

        let hash = content_hash(&Some(parent_hash.clone()), &message, &staged);
        let now = Utc::now();

        let mut tx = self.db.raw().begin().await?;
        sqlx::query(
            "INSERT INTO commits (commit_hash, parent_hash, task_id, message, vm_state, committed_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&hash)
        .bind(&parent_hash)
        .bind(&self.task_id)
        .bind(serde_json::to_string(&message)?)
        .bind(serde_json::to_string(&staged)?)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE branches SET head_commit_hash = ? WHERE task_id = ? AND name = ?",
        )
        .bind(&hash)
        .bind(&self.task_id)
        .bind(&branch)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(hash)
    }

    async fn get_state_diff(&self, hash: &str) -> Result<StateDiff> {
        let commit = self.read_commit(hash).await?;
        match &commit.parent_hash {
            Some(parent_hash) => {
                let parent = self.read_commit(parent_hash).await?;
                Ok(diff_state(&parent.vm_state, &commit.vm_state))
            }
            None => Ok(StateDiff::default()),
        }
    }
}
