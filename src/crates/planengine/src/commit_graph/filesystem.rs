//! Filesystem commit graph back end: a content-addressed object store under
//! a per-task working directory.
//!
//! Grounded on `original_source/app/storage/branch_manager/git.py`'s
//! contract (one commit per state write, branches as refs, no-op detection
//! via a staged-changes check) without shelling out to a real VCS; commits
//! are `sha2`-hashed JSON objects and branches are plain ref files, per
//! SPEC_FULL.md's "Filesystem commit graph" note.

use super::{diff_state, message_preview, BranchInfo, Commit, CommitGraph, CommitGraphError, CommitMessage, CommitType, Result, StateDiff};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

const MESSAGE_PREVIEW_LEN: usize = 50;
const MAIN_BRANCH: &str = "main";

/// One task's working directory: `<root>/objects/<hash>.json`,
/// `<root>/refs/<branch>`, `<root>/HEAD`, `<root>/staged.json`.
pub struct FilesystemCommitGraph {
    root: PathBuf,
    lock: RwLock<()>,
}

impl FilesystemCommitGraph {
    /// Open (creating if necessary) a task's working directory, seeding an
    /// initial empty commit and `main` branch on first use.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("objects")).await?;
        fs::create_dir_all(root.join("refs")).await?;
        let graph = Self { root, lock: RwLock::new(()) };

        if !graph.head_path().exists() {
            let initial = Commit {
                commit_hash: String::new(),
                parent_hash: None,
                message: CommitMessage {
                    commit_type: CommitType::GeneratePlan,
                    seq_no: None,
                    description: "initial state".into(),
                    input_parameters: Value::Null,
                    output_variables: Value::Null,
                    execution_error: None,
                },
                vm_state: Value::Object(Default::default()),
                committed_at: Utc::now(),
            };
            let hash = graph.write_commit_object(&initial).await?;
            graph.write_ref(MAIN_BRANCH, &hash).await?;
            graph.set_head(MAIN_BRANCH).await?;
        }

        Ok(graph)
    }

    fn head_path(&self) -> PathBuf {
        self.root.join("HEAD")
    }

    fn ref_path(&self, branch: &str) -> PathBuf {
        self.root.join("refs").join(branch)
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        self.root.join("objects").join(format!("{hash}.json"))
    }

    fn staged_path(&self) -> PathBuf {
        self.root.join("staged.json")
    }

    async fn set_head(&self, branch: &str) -> Result<()> {
        fs::write(self.head_path(), branch).await?;
        Ok(())
    }

    async fn write_ref(&self, branch: &str, hash: &str) -> Result<()> {
        fs::write(self.ref_path(branch), hash).await?;
        Ok(())
    }

    async fn write_commit_object(&self, commit: &Commit) -> Result<String> {
        let hash = content_hash(&commit.parent_hash, &commit.message, &commit.vm_state);
        let mut stored = commit.clone();
        stored.commit_hash = hash.clone();
        fs::write(self.object_path(&hash), serde_json::to_vec(&stored)?).await?;
        Ok(hash)
    }

    async fn read_commit(&self, hash: &str) -> Result<Commit> {
        let bytes = fs::read(self.object_path(hash))
            .await
            .map_err(|_| CommitGraphError::CommitNotFound(hash.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn branches(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(self.root.join("refs")).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    async fn head_hash(&self, branch: &str) -> Result<String> {
        let path = self.ref_path(branch);
        let bytes = fs::read_to_string(&path)
            .await
            .map_err(|_| CommitGraphError::BranchNotFound(branch.to_string()))?;
        Ok(bytes.trim().to_string())
    }
}

fn content_hash(parent: &Option<String>, message: &CommitMessage, state: &Value) -> String {
    let canonical = serde_json::json!({
        "parent": parent,
        "message": message,
        "state": state,
    });
    let stable = tooling::serialization::to_stable_json(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(stable.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl CommitGraph for FilesystemCommitGraph {
    async fn list_branches(&self) -> Result<Vec<BranchInfo>> {
        let _guard = self.lock.read().await;
        let active = fs::read_to_string(self.head_path()).await.unwrap_or_default();
        let active = active.trim().to_string();

        let mut infos = Vec::new();
        for name in self.branches().await? {
            let head = self.head_hash(&name).await?;
            let commit = self.read_commit(&head).await?;
            infos.push(BranchInfo {
                name: name.clone(),
                head_commit_hash: head,
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
        let _guard = self.lock.write().await;
        if !self.ref_path(name).exists() {
            return Err(CommitGraphError::BranchNotFound(name.to_string()));
        }
        self.set_head(name).await
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        let branches = self.branches().await?;
        if branches.len() <= 1 {
            return Err(CommitGraphError::LastBranch);
        }
        if !self.ref_path(name).exists() {
            return Err(CommitGraphError::BranchNotFound(name.to_string()));
        }

        let active = fs::read_to_string(self.head_path()).await.unwrap_or_default();
        let active = active.trim().to_string();
        if active == name {
            let fallback = branches
                .iter()
                .find(|b| b.as_str() == MAIN_BRANCH && b != name)
                .or_else(|| branches.iter().find(|b| b.as_str() != name))
                .cloned()
                .expect("at least one other branch exists");
            self.set_head(&fallback).await?;
        }

        fs::remove_file(self.ref_path(name)).await?;
        Ok(())
    }

    async fn checkout_branch_from_commit(&self, name: &str, hash: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        self.read_commit(hash).await?;
        self.write_ref(name, hash).await?;
        self.set_head(name).await
    }

    async fn get_current_branch(&self) -> Result<String> {
        let _guard = self.lock.read().await;
        Ok(fs::read_to_string(self.head_path()).await?.trim().to_string())
    }

    async fn get_current_commit_hash(&self) -> Result<String> {
        let branch = self.get_current_branch().await?;
        self.head_hash(&branch).await
    }

    async fn get_parent_commit_hash(&self, hash: &str) -> Result<Option<String>> {
        let _guard = self.lock.read().await;
        Ok(self.read_commit(hash).await?.parent_hash)
    }

    async fn get_commit_hashes(&self, branch: &str) -> Result<Vec<String>> {
        let _guard = self.lock.read().await;
        let mut hash = self.head_hash(branch).await?;
        let mut out = Vec::new();
        loop {
            out.push(hash.clone());
            let commit = self.read_commit(&hash).await?;
            match commit.parent_hash {
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
        let _guard = self.lock.read().await;
        self.read_commit(hash).await
    }

    async fn get_latest_commit(&self, branch: &str) -> Result<Commit> {
        let _guard = self.lock.read().await;
        let hash = self.head_hash(branch).await?;
        self.read_commit(&hash).await
    }

    async fn load_state(&self, hash: &str) -> Result<Value> {
        let _guard = self.lock.read().await;
        Ok(self.read_commit(hash).await?.vm_state)
    }

    async fn get_all_commits(&self) -> Result<Vec<Commit>> {
        let _guard = self.lock.read().await;
        let mut entries = fs::read_dir(self.root.join("objects")).await?;
        let mut commits = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let bytes = fs::read(entry.path()).await?;
            commits.push(serde_json::from_slice(&bytes)?);
        }
        Ok(commits)
    }

    async fn update_state(&self, vm_state: Value) -> Result<()> {
        let _guard = self.lock.write().await;
        fs::write(self.staged_path(), serde_json::to_vec(&vm_state)?).await?;
        Ok(())
    }

    async fn commit_changes(&self, message: CommitMessage) -> Result<String> {
        let _guard = self.lock.write().await;
        let branch = fs::read_to_string(self.head_path()).await?.trim().to_string();
        let parent_hash = self.head_hash(&branch).await?;

        let staged = match fs::read(self.staged_path()).await {
            Ok(bytes) => serde_json::from_slice::<Value>(&bytes)?,
            Err(_) => return Ok(parent_hash),
        };

        let parent_commit = self.read_commit(&parent_hash).await?;
        if parent_commit.vm_state == staged {
            return Ok(parent_hash);
        }

        let commit = Commit {
            commit_hash: String::new(),
            parent_hash: Some(parent_hash),
            message,
            vm_state: staged,
            committed_at: Utc::now(),
        };
        let hash = self.write_commit_object(&commit).await?;
        self.write_ref(&branch, &hash).await?;
        let _ = fs::remove_file(self.staged_path()).await;
        Ok(hash)
    }

    async fn get_state_diff(&self, hash: &str) -> Result<StateDiff> {
        let _guard = self.lock.read().await;
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

impl FilesystemCommitGraph {
    #[cfg(test)]
    pub(crate) fn root_path(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_tmp() -> (FilesystemCommitGraph, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let graph = FilesystemCommitGraph::open(dir.path()).await.unwrap();
        (graph, dir)
    }

    fn msg(desc: &str) -> CommitMessage {
        CommitMessage {
            commit_type: CommitType::StepExecution,
            seq_no: Some(0),
            description: desc.into(),
            input_parameters: Value::Null,
            output_variables: Value::Null,
            execution_error: None,
        }
    }

    #[tokio::test]
    async fn fresh_task_has_main_branch_with_initial_commit() {
        let (graph, _dir) = open_tmp().await;
        let branches = graph.list_branches().await.unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].name, "main");
        assert!(branches[0].is_active);
    }

    #[tokio::test]
    async fn commit_changes_roundtrips_state() {
        let (graph, _dir) = open_tmp().await;
        graph.update_state(json!({"goal_completed": true})).await.unwrap();
        let hash = graph.commit_changes(msg("step 0")).await.unwrap();
        let loaded = graph.load_state(&hash).await.unwrap();
        assert_eq!(loaded, json!({"goal_completed": true}));
    }

    #[tokio::test]
    async fn commit_changes_with_no_staged_state_is_a_noop() {
        let (graph, _dir) = open_tmp().await;
        let head_before = graph.get_current_commit_hash().await.unwrap();
        let head_after = graph.commit_changes(msg("nothing changed")).await.unwrap();
        assert_eq!(head_before, head_after);
    }

    #[tokio::test]
    async fn branch_from_commit_and_list() {
        let (graph, _dir) = open_tmp().await;
        graph.update_state(json!({"step": 0})).await.unwrap();
        let hash0 = graph.commit_changes(msg("step 0")).await.unwrap();
        graph.update_state(json!({"step": 1})).await.unwrap();
        graph.commit_changes(msg("step 1")).await.unwrap();

        graph.checkout_branch_from_commit("alt", &hash0).await.unwrap();
        let branches = graph.list_branches().await.unwrap();
        let alt = branches.iter().find(|b| b.name == "alt").unwrap();
        assert_eq!(alt.head_commit_hash, hash0);
        let main = branches.iter().find(|b| b.name == "main").unwrap();
        assert_ne!(main.head_commit_hash, hash0);
    }

    #[tokio::test]
    async fn deleting_active_branch_switches_to_main() {
        let (graph, _dir) = open_tmp().await;
        graph.update_state(json!({"step": 0})).await.unwrap();
        let hash0 = graph.commit_changes(msg("step 0")).await.unwrap();
        graph.checkout_branch_from_commit("alt", &hash0).await.unwrap();

        graph.delete_branch("alt").await.unwrap();
        assert_eq!(graph.get_current_branch().await.unwrap(), "main");
    }

    #[tokio::test]
    async fn deleting_only_branch_fails() {
        let (graph, _dir) = open_tmp().await;
        assert!(graph.delete_branch("main").await.is_err());
    }

    #[tokio::test]
    async fn deleting_inactive_branch_preserves_active() {
        let (graph, _dir) = open_tmp().await;
        graph.update_state(json!({"step": 0})).await.unwrap();
        let hash0 = graph.commit_changes(msg("step 0")).await.unwrap();
        graph.checkout_branch_from_commit("alt", &hash0).await.unwrap();
        graph.checkout_branch("main").await.unwrap();

        graph.delete_branch("alt").await.unwrap();
        assert_eq!(graph.get_current_branch().await.unwrap(), "main");
    }

    #[tokio::test]
    async fn state_diff_reports_additions_and_modifications() {
        let (graph, _dir) = open_tmp().await;
        graph.update_state(json!({"a": 1})).await.unwrap();
        graph.commit_changes(msg("first")).await.unwrap();
        graph.update_state(json!({"a": 2, "b": 3})).await.unwrap();
        let hash = graph.commit_changes(msg("second")).await.unwrap();

        let diff = graph.get_state_diff(&hash).await.unwrap();
        assert_eq!(diff.additions.len(), 1);
        assert_eq!(diff.modifications.len(), 1);
    }
}
