//! Task manager: the per-task orchestration layer binding goals to plans,
//! VM runs, and persisted state (spec.md §4.9).
//!
//! Grounded on `original_source/app/core/task/manager.py`: a single lock
//! serializes `execute`/`update`/`re_execute`/`optimize_step`/`save` against
//! each other per task (the Python original uses a plain, non-reentrant
//! `threading.Lock`, so this is not true reentrancy — it just means those
//! five operations never run concurrently on the same task); read-only
//! accessors bypass the lock entirely.

pub mod goal_format;
pub mod queue;

use crate::cache::PlanCache;
use crate::commit_graph::relational::RelationalCommitGraph;
use crate::commit_graph::{
    BranchInfo, Commit, CommitGraph, CommitMessage, CommitType, StateDiff,
};
use crate::db::DatabasePool;
use crate::error::{PlanEngineError, Result};
use crate::labels::LabelClassifier;
use crate::plan::generator::{self, GenerationHints};
use crate::plan::optimizer;
use crate::plan::Plan;
use crate::tools::ToolRegistry;
use crate::vm::{PlanVm, RunOutcome, VmState};
use chrono::{DateTime, Utc};
use llm::LlmProvider;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

impl From<generator::GeneratorError> for PlanEngineError {
    fn from(err: generator::GeneratorError) -> Self {
        match err {
            generator::GeneratorError::PlanUnavailable(msg) => PlanEngineError::PlanUnavailable(msg),
            generator::GeneratorError::Llm(err) => PlanEngineError::Llm(err),
        }
    }
}

impl From<optimizer::OptimizerError> for PlanEngineError {
    fn from(err: optimizer::OptimizerError) -> Self {
        match err {
            optimizer::OptimizerError::Unavailable(msg) => PlanEngineError::PlanUnavailable(msg),
            optimizer::OptimizerError::PrefixViolated(pc) => {
                PlanEngineError::Other(format!("updated plan changed a step before program_counter {pc}"))
            }
            optimizer::OptimizerError::Llm(err) => PlanEngineError::Llm(err),
        }
    }
}

impl From<crate::labels::LabelError> for PlanEngineError {
    fn from(err: crate::labels::LabelError) -> Self {
        match err {
            crate::labels::LabelError::Llm(err) => PlanEngineError::Llm(err),
            crate::labels::LabelError::Database(err) => {
                PlanEngineError::CommitGraph(crate::commit_graph::CommitGraphError::from(err))
            }
            crate::labels::LabelError::MalformedPath(msg) => PlanEngineError::Other(msg),
            crate::labels::LabelError::TaskNotFound(id) => PlanEngineError::TaskNotFound(id),
        }
    }
}

/// Lifecycle status of a task row, spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Deleted,
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Deleted => "deleted",
    }
}

/// Automated or human evaluation verdict on a completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationStatus {
    NotEvaluated,
    Accepted,
    Rejected,
}

fn evaluation_status_str(status: EvaluationStatus) -> &'static str {
    match status {
        EvaluationStatus::NotEvaluated => "NOT_EVALUATED",
        EvaluationStatus::Accepted => "ACCEPTED",
        EvaluationStatus::Rejected => "REJECTED",
    }
}

/// Persisted task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub goal: String,
    pub status: TaskStatus,
    pub meta: Option<Value>,
    pub best_plan: Option<Value>,
    pub namespace: Option<String>,
    pub label: Option<String>,
    pub evaluation_status: EvaluationStatus,
    pub evaluation_reason: Option<String>,
    pub human_evaluation_status: EvaluationStatus,
    pub human_evaluation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<TaskRecord> {
    let status_raw: String = row.get("status");
    let evaluation_status_raw: String = row.get("evaluation_status");
    let human_evaluation_status_raw: String = row.get("human_evaluation_status");
    let meta_raw: Option<String> = row.get("meta");
    let best_plan_raw: Option<String> = row.get("best_plan");
    let created_at_raw: String = row.get("created_at");
    let updated_at_raw: String = row.get("updated_at");

    Ok(TaskRecord {
        id: Uuid::parse_str(&row.get::<String, _>("id"))
            .map_err(|e| PlanEngineError::Other(format!("invalid task id: {e}")))?,
        goal: row.get("goal"),
        status: serde_json::from_value(Value::String(status_raw))?,
        meta: meta_raw.and_then(|s| serde_json::from_str(&s).ok()),
        best_plan: best_plan_raw.and_then(|s| serde_json::from_str(&s).ok()),
        namespace: row.get("namespace"),
        label: row.get("label"),
        evaluation_status: serde_json::from_value(Value::String(evaluation_status_raw))?,
        evaluation_reason: row.get("evaluation_reason"),
        human_evaluation_status: serde_json::from_value(Value::String(human_evaluation_status_raw))?,
        human_evaluation_reason: row.get("human_evaluation_reason"),
        created_at: created_at_raw
            .parse()
            .map_err(|e| PlanEngineError::Other(format!("invalid created_at: {e}")))?,
        updated_at: updated_at_raw
            .parse()
            .map_err(|e| PlanEngineError::Other(format!("invalid updated_at: {e}")))?,
    })
}

/// Outcome of `re_execute`, carrying the branch it ran on regardless of
/// completion.
#[derive(Debug, Clone, Serialize)]
pub struct ReExecuteOutcome {
    pub completed: bool,
    pub final_answer: Option<Value>,
    pub branch_name: String,
}

/// A single active task: goal, lifecycle state, and the serialized
/// operations that advance it.
pub struct Task {
    db: DatabasePool,
    llm: Arc<dyn LlmProvider>,
    reasoning_llm: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    classifier: Arc<LabelClassifier>,
    cache: Arc<PlanCache>,
    vm_spec: Arc<str>,
    record: RwLock<TaskRecord>,
    op_lock: Mutex<()>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    fn new(
        record: TaskRecord,
        db: DatabasePool,
        llm: Arc<dyn LlmProvider>,
        reasoning_llm: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        classifier: Arc<LabelClassifier>,
        cache: Arc<PlanCache>,
        vm_spec: Arc<str>,
    ) -> Self {
        Self {
            db,
            llm,
            reasoning_llm,
            tools,
            classifier,
            cache,
            vm_spec,
            record: RwLock::new(record),
            op_lock: Mutex::new(()),
        }
    }

    pub async fn id(&self) -> Uuid {
        self.record.read().await.id
    }

    pub async fn snapshot(&self) -> TaskRecord {
        self.record.read().await.clone()
    }

    async fn allowed_tools(&self) -> Result<Option<Vec<String>>> {
        let namespace = self.record.read().await.namespace.clone();
        let Some(namespace) = namespace else {
            return Ok(None);
        };
        let allowed_tools: Option<String> =
            sqlx::query_scalar("SELECT allowed_tools FROM namespaces WHERE name = ?")
                .bind(&namespace)
                .fetch_optional(self.db.raw())
                .await
                .map_err(crate::commit_graph::CommitGraphError::from)?;
        Ok(allowed_tools.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn commit_graph(&self) -> Result<RelationalCommitGraph> {
        let id = self.id().await;
        Ok(RelationalCommitGraph::open(self.db.clone(), id.to_string()).await?)
    }

    /// Read-only: does not take `op_lock`.
    pub async fn list_branches(&self) -> Result<Vec<BranchInfo>> {
        Ok(self.commit_graph().await?.list_branches().await?)
    }

    /// Read-only: does not take `op_lock`.
    pub async fn get_current_branch(&self) -> Result<String> {
        Ok(self.commit_graph().await?.get_current_branch().await?)
    }

    /// Deletes `branch_name`. Does not take `op_lock`: branch bookkeeping is
    /// independent of the VM-run lifecycle the lock serializes.
    pub async fn delete_branch(&self, branch_name: &str) -> Result<()> {
        Ok(self.commit_graph().await?.delete_branch(branch_name).await?)
    }

    /// Read-only: does not take `op_lock`.
    pub async fn get_execution_details(
        &self,
        branch_name: Option<&str>,
        commit_hash: Option<&str>,
    ) -> Result<Vec<Commit>> {
        let graph = self.commit_graph().await?;
        if let Some(hash) = commit_hash {
            return Ok(vec![graph.get_commit(hash).await?]);
        }
        let branch = branch_name
            .ok_or_else(|| PlanEngineError::Other("branch name or commit hash is required".into()))?;
        Ok(graph.get_commits(branch).await?)
    }

    /// Read-only: does not take `op_lock`.
    pub async fn get_answer_detail(&self, branch_name: &str) -> Result<Commit> {
        Ok(self.commit_graph().await?.get_latest_commit(branch_name).await?)
    }

    /// Read-only: does not take `op_lock`.
    pub async fn get_state_diff(&self, commit_hash: &str) -> Result<StateDiff> {
        Ok(self.commit_graph().await?.get_state_diff(commit_hash).await?)
    }

    /// Every commit this task has ever written, on any branch. Read-only:
    /// does not take `op_lock`. Used by plan optimization to rebuild the
    /// full history tree rather than just the active branch's ancestry.
    pub async fn get_all_commits(&self) -> Result<Vec<Commit>> {
        Ok(self.commit_graph().await?.get_all_commits().await?)
    }

    /// The judge model used for plan-quality prompts (answer acceptance,
    /// step reflection, candidate ranking). Shared with plan generation
    /// rather than the step-execution model, since these are reasoning
    /// judgments, not tool calls.
    pub fn reasoning_llm(&self) -> Arc<dyn LlmProvider> {
        self.reasoning_llm.clone()
    }

    async fn try_lock_op(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.op_lock
            .try_lock()
            .map_err(|_| PlanEngineError::TaskBusy(self.id().await.to_string()))
    }

    async fn mark_failed(&self, message: String) {
        tracing::error!(message, "task operation failed");
        self.record.write().await.status = TaskStatus::Failed;
        if let Err(err) = self.persist().await {
            tracing::error!(error = %err, "failed to persist task failure status");
        }
    }

    async fn persist(&self) -> Result<()> {
        let record = self.record.read().await.clone();
        let meta = record.meta.as_ref().map(|v| v.to_string());
        let best_plan = record.best_plan.as_ref().map(|v| v.to_string());
        sqlx::query(
            "UPDATE tasks SET status = ?, meta = ?, best_plan = ?, namespace = ?, label = ?, \
             evaluation_status = ?, evaluation_reason = ?, human_evaluation_status = ?, \
             human_evaluation_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(task_status_str(record.status))
        .bind(&meta)
        .bind(&best_plan)
        .bind(&record.namespace)
        .bind(&record.label)
        .bind(evaluation_status_str(record.evaluation_status))
        .bind(&record.evaluation_reason)
        .bind(evaluation_status_str(record.human_evaluation_status))
        .bind(&record.human_evaluation_reason)
        .bind(Utc::now().to_rfc3339())
        .bind(record.id.to_string())
        .execute(self.db.raw())
        .await
        .map_err(crate::commit_graph::CommitGraphError::from)?;
        Ok(())
    }

    /// Marks the task's terminal status from a VM run's outcome and
    /// persists it. `Exhausted` (the plan ran out of steps without ever
    /// installing `final_answer`) is treated as a failure.
    async fn finish_run(&self, outcome: &RunOutcome) -> Result<()> {
        let status = match outcome {
            RunOutcome::Completed { .. } => TaskStatus::Completed,
            RunOutcome::Failed { .. } => TaskStatus::Failed,
            RunOutcome::Exhausted => TaskStatus::Failed,
        };
        self.record.write().await.status = status;
        self.persist().await
    }

    /// Generates a plan for this task's goal, preferring a cached exact
    /// match, then a label-tree example, then a fresh LLM generation
    /// (spec.md §4.9 `execute`, grounded on `Task.generate_plan`).
    async fn generate_plan(&self) -> Result<(String, Plan)> {
        let record = self.record.read().await.clone();
        let response_format = record.meta.as_ref().and_then(|m| m.get("response_format").cloned());

        let mut example_str: Option<String> = None;
        if let Some(hit) = self.cache.get(&record.goal, response_format.as_ref()).await {
            if hit.matched {
                if let Ok(plan) = serde_json::from_value::<Plan>(hit.plan.best_plan.clone()) {
                    return Ok((String::new(), plan));
                }
            }
            example_str = Some(format!(
                "**Goal**:\n{}\n**The plan:**\n{}\n",
                hit.plan.goal, hit.plan.best_plan
            ));
        }

        let mut best_practices = None;
        if example_str.is_none() {
            if let Some(namespace) = record.namespace.clone() {
                match self.classifier.generate_label_path(&namespace, &record.goal).await {
                    Ok(classification) => {
                        if let Some(example) = &classification.most_similar_task {
                            if let Some(best_plan) = &example.best_plan {
                                example_str = Some(format!(
                                    "**Goal**:\n{}\n**The plan:**\n{}\n",
                                    example.goal, best_plan
                                ));
                            }
                        }
                        best_practices = classification.best_practices.clone();
                        if !classification.label_path.is_empty() {
                            let mut record = self.record.write().await;
                            let mut meta =
                                record.meta.clone().unwrap_or_else(|| Value::Object(Default::default()));
                            if let Some(map) = meta.as_object_mut() {
                                map.insert(
                                    "label_path".into(),
                                    serde_json::to_value(&classification.label_path)?,
                                );
                            }
                            record.meta = Some(meta);
                        }
                    }
                    Err(err) => tracing::error!(error = %err, "failed to generate label path"),
                }
            }
        }

        let mut goal = record.goal.clone();
        if let Some(rf) = &response_format {
            goal = format!("{goal} {rf}");
        }

        let hints = GenerationHints {
            example: example_str,
            best_practices,
            allowed_tools: self.allowed_tools().await?,
        };
        let parsed =
            generator::generate_plan(self.reasoning_llm.as_ref(), &goal, &self.vm_spec, &self.tools, &hints)
                .await?;
        Ok((parsed.reasoning, parsed.plan))
    }

    /// Generates a plan, runs it to completion, and marks the task failed
    /// (without unwinding) if anything along the way errors.
    pub async fn execute(&self) -> Result<RunOutcome> {
        let _guard = self.try_lock_op().await?;
        match self.execute_inner().await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.mark_failed(format!("failed to execute task: {err}")).await;
                Err(err)
            }
        }
    }

    async fn execute_inner(&self) -> Result<RunOutcome> {
        let (reasoning, plan) = self.generate_plan().await?;
        if plan.is_empty() {
            return Err(PlanEngineError::PlanUnavailable("failed to generate plan".into()));
        }

        let goal = self.record.read().await.goal.clone();
        let commit_graph: Arc<dyn CommitGraph> = Arc::new(self.commit_graph().await?);

        let vm_state = VmState::new(goal, plan, reasoning);
        commit_graph.update_state(serde_json::to_value(&vm_state)?).await?;
        commit_graph
            .commit_changes(CommitMessage {
                commit_type: CommitType::GeneratePlan,
                seq_no: None,
                description: "generated initial plan".into(),
                input_parameters: Value::Null,
                output_variables: Value::Null,
                execution_error: None,
            })
            .await?;

        let mut vm = PlanVm::from_state(vm_state, self.tools.clone(), self.llm.clone(), commit_graph);
        let outcome = vm.run_to_completion().await?;
        self.finish_run(&outcome).await?;
        Ok(outcome)
    }

    /// Like [`execute`](Self::execute), but steps the VM by hand instead of
    /// calling [`PlanVm::run_to_completion`] so the API layer's streaming
    /// endpoint can publish a wire event at every step boundary: a tool
    /// call before a `calling` step runs, a state annotation and step-finish
    /// event after, and the finished answer split into sentence-sized text
    /// chunks once the goal completes.
    pub async fn execute_streaming(&self, events: &crate::streaming::StreamProducer) -> Result<RunOutcome> {
        let _guard = self.try_lock_op().await?;
        match self.execute_streaming_inner(events).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.mark_failed(format!("failed to execute task: {err}")).await;
                Err(err)
            }
        }
    }

    async fn execute_streaming_inner(&self, events: &crate::streaming::StreamProducer) -> Result<RunOutcome> {
        use crate::streaming::{StateAnnotation, StreamingProtocol};

        let (reasoning, plan) = self.generate_plan().await?;
        if plan.is_empty() {
            return Err(PlanEngineError::PlanUnavailable("failed to generate plan".into()));
        }

        let task_id = self.id().await;
        let goal = self.record.read().await.goal.clone();
        let commit_graph: Arc<dyn CommitGraph> = Arc::new(self.commit_graph().await?);
        let branch = commit_graph.get_current_branch().await?;

        let vm_state = VmState::new(goal, plan, reasoning);
        commit_graph.update_state(serde_json::to_value(&vm_state)?).await?;
        commit_graph
            .commit_changes(CommitMessage {
                commit_type: CommitType::GeneratePlan,
                seq_no: None,
                description: "generated initial plan".into(),
                input_parameters: Value::Null,
                output_variables: Value::Null,
                execution_error: None,
            })
            .await?;

        let mut vm = PlanVm::from_state(vm_state, self.tools.clone(), self.llm.clone(), commit_graph);

        let outcome = loop {
            let pc = vm.state().program_counter.max(0) as usize;
            if let Some(step) = vm.state().current_plan.step_at(pc) {
                if step.step_type == crate::plan::StepType::Calling {
                    let tool_name =
                        step.parameters.get("tool_name").and_then(|v| v.as_str()).unwrap_or("unknown");
                    let tool_args = step.parameters.get("tool_params").cloned().unwrap_or(Value::Null);
                    events.send_chunk(
                        StreamingProtocol::tool_call(&step.seq_no.to_string(), tool_name, &tool_args).to_line(),
                    );
                }
            }

            match vm.step().await? {
                Ok(advance) => {
                    events.send_chunk(
                        StreamingProtocol::annotation(&[StateAnnotation {
                            task_id: task_id.to_string(),
                            branch: branch.clone(),
                            seq_no: advance.seq_no,
                            state: serde_json::to_value(vm.state())?,
                        }])
                        .to_line(),
                    );
                    events.send_chunk(StreamingProtocol::step_finish(advance.seq_no, "step").to_line());

                    if advance.goal_completed {
                        break RunOutcome::Completed { commit_hash: advance.commit_hash };
                    }
                }
                Err(failure) => {
                    events.send_chunk(StreamingProtocol::error_part(&failure.error_message).to_line());
                    break RunOutcome::Failed {
                        commit_hash: failure.commit_hash,
                        error_message: failure.error_message,
                    };
                }
            }
        };

        self.finish_run(&outcome).await?;

        match &outcome {
            RunOutcome::Completed { .. } => {
                let final_answer = vm.state().variables.get("final_answer").cloned();
                if let Some(text) = final_answer.as_ref().and_then(|v| v.as_str()) {
                    for sentence in crate::streaming::split_into_sentences(text) {
                        events.send_chunk(StreamingProtocol::text_part(&sentence).to_line());
                    }
                }
                events.send_chunk(StreamingProtocol::finish_message("stop", final_answer).to_line());
            }
            RunOutcome::Failed { .. } | RunOutcome::Exhausted => {
                events.send_chunk(StreamingProtocol::finish_message("error", None).to_line());
            }
        }

        Ok(outcome)
    }

    /// Re-runs from either a named commit or the earliest commit on the
    /// current head, optionally overriding the plan (spec.md §4.9
    /// `re_execute`).
    pub async fn re_execute(
        &self,
        reasoning: Option<String>,
        commit_hash: Option<String>,
        plan_override: Option<Plan>,
    ) -> Result<ReExecuteOutcome> {
        let _guard = self.try_lock_op().await?;
        match self.re_execute_inner(reasoning, commit_hash, plan_override).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.mark_failed(format!("failed to re-execute task: {err}")).await;
                Err(err)
            }
        }
    }

    async fn re_execute_inner(
        &self,
        reasoning: Option<String>,
        commit_hash: Option<String>,
        plan_override: Option<Plan>,
    ) -> Result<ReExecuteOutcome> {
        let branch_name = format!("re_execute_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let graph = self.commit_graph().await?;
        let goal = self.record.read().await.goal.clone();

        let state = if let Some(hash) = &commit_hash {
            graph.checkout_branch_from_commit(&branch_name, hash).await?;
            let loaded = graph.load_state(hash).await?;
            serde_json::from_value::<VmState>(loaded)?
        } else {
            let hashes = graph.get_commit_hashes("main").await?;
            let earliest = hashes
                .last()
                .ok_or_else(|| PlanEngineError::Other("no commits to re-execute from".into()))?
                .clone();
            graph.checkout_branch_from_commit(&branch_name, &earliest).await?;

            let seed_plan = match plan_override {
                Some(plan) => plan,
                None => {
                    let commit = graph.get_commit(&earliest).await?;
                    let loaded: VmState = serde_json::from_value(commit.vm_state)?;
                    loaded.current_plan
                }
            };
            VmState::new(goal, seed_plan, reasoning.unwrap_or_default())
        };

        let commit_graph: Arc<dyn CommitGraph> = Arc::new(graph);
        let mut vm = PlanVm::from_state(state, self.tools.clone(), self.llm.clone(), commit_graph);
        let outcome = vm.run_to_completion().await?;
        self.finish_run(&outcome).await?;

        let completed = matches!(outcome, RunOutcome::Completed { .. });
        let final_answer =
            if completed { vm.state().variables.get("final_answer").cloned() } else { None };
        Ok(ReExecuteOutcome { completed, final_answer, branch_name })
    }

    /// Creates `new_branch_name` from a base commit (the earliest commit if
    /// `from_scratch`, else `commit_hash`), optimizes the plan from there,
    /// and runs to completion (spec.md §4.9 `update`).
    pub async fn update(
        &self,
        new_branch_name: String,
        commit_hash: Option<String>,
        suggestion: String,
        from_scratch: bool,
        source_branch: Option<String>,
    ) -> Result<RunOutcome> {
        let _guard = self.try_lock_op().await?;
        match self
            .update_inner(new_branch_name, commit_hash, suggestion, from_scratch, source_branch)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.mark_failed(format!("failed to update task: {err}")).await;
                Err(err)
            }
        }
    }

    async fn update_inner(
        &self,
        new_branch_name: String,
        mut commit_hash: Option<String>,
        suggestion: String,
        from_scratch: bool,
        source_branch: Option<String>,
    ) -> Result<RunOutcome> {
        let graph = self.commit_graph().await?;

        if from_scratch {
            let hashes = graph.get_commit_hashes("main").await?;
            if hashes.len() <= 1 {
                return Err(PlanEngineError::Other(
                    "choose an existing branch with a plan to update from scratch".into(),
                ));
            }
            commit_hash = Some(hashes.last().unwrap().clone());
        }
        let commit_hash = commit_hash.ok_or_else(|| {
            PlanEngineError::Other("commit_hash must be provided if not updating from scratch".into())
        })?;

        let (base_state, base_commit_for_branch) = if let Some(source) = &source_branch {
            graph.checkout_branch(source).await?;
            let latest = graph.get_latest_commit(source).await?;
            (serde_json::from_value::<VmState>(latest.vm_state)?, commit_hash.clone())
        } else {
            let commit = graph.get_commit(&commit_hash).await?;
            (serde_json::from_value::<VmState>(commit.vm_state)?, commit_hash.clone())
        };

        graph.checkout_branch_from_commit(&new_branch_name, &base_commit_for_branch).await?;

        let allowed_tools = self.allowed_tools().await?;
        let updated_plan = optimizer::optimize_partial_plan(
            self.reasoning_llm.as_ref(),
            &base_state.goal,
            base_state.program_counter,
            &base_state.current_plan,
            &base_state.reasoning,
            &Value::String(suggestion.clone()),
            &self.vm_spec,
            &self.tools,
            allowed_tools.as_deref(),
        )
        .await?;

        let mut vm_state = base_state;
        vm_state.current_plan = updated_plan;

        let commit_graph: Arc<dyn CommitGraph> = Arc::new(graph);
        commit_graph.update_state(serde_json::to_value(&vm_state)?).await?;
        commit_graph
            .commit_changes(CommitMessage {
                commit_type: CommitType::PlanUpdate,
                seq_no: Some(vm_state.program_counter),
                description: suggestion,
                input_parameters: Value::Null,
                output_variables: Value::Null,
                execution_error: None,
            })
            .await?;

        let mut vm = PlanVm::from_state(vm_state, self.tools.clone(), self.llm.clone(), commit_graph);
        vm.recalculate_variable_refs();
        let outcome = vm.run_to_completion().await?;
        self.finish_run(&outcome).await?;
        Ok(outcome)
    }

    /// Replaces a single step at `seq_no`, branching from the parent of
    /// `commit_hash`, then runs to completion (spec.md §4.9
    /// `optimize_step`).
    pub async fn optimize_step(&self, commit_hash: String, seq_no: i64, suggestion: String) -> Result<RunOutcome> {
        let _guard = self.try_lock_op().await?;
        match self.optimize_step_inner(commit_hash, seq_no, suggestion).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.mark_failed(format!("failed to optimize step: {err}")).await;
                Err(err)
            }
        }
    }

    async fn optimize_step_inner(&self, commit_hash: String, seq_no: i64, suggestion: String) -> Result<RunOutcome> {
        let graph = self.commit_graph().await?;
        let commit = graph.get_commit(&commit_hash).await?;
        let mut state: VmState = serde_json::from_value(commit.vm_state)?;

        let index = state
            .current_plan
            .find_step_index(seq_no)
            .ok_or_else(|| PlanEngineError::Other(format!("step {seq_no} not found in plan")))?;

        let allowed_tools = self.allowed_tools().await?;
        let replacement = optimizer::optimize_single_step(
            self.reasoning_llm.as_ref(),
            &state.goal,
            &state.current_plan,
            seq_no,
            &Value::String(suggestion.clone()),
            &self.vm_spec,
            &self.tools,
            allowed_tools.as_deref(),
        )
        .await?;

        let previous_commit_hash = graph.get_parent_commit_hash(&commit_hash).await?;
        let base = previous_commit_hash
            .ok_or_else(|| PlanEngineError::Other("step has no parent commit to branch from".into()))?;
        let branch_name = format!("optimize_step_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        graph.checkout_branch_from_commit(&branch_name, &base).await?;

        state.current_plan.steps[index] = replacement;
        state.program_counter = seq_no;

        let commit_graph: Arc<dyn CommitGraph> = Arc::new(graph);
        commit_graph.update_state(serde_json::to_value(&state)?).await?;
        commit_graph
            .commit_changes(CommitMessage {
                commit_type: CommitType::StepOptimization,
                seq_no: Some(seq_no),
                description: suggestion,
                input_parameters: Value::Null,
                output_variables: Value::Null,
                execution_error: None,
            })
            .await?;

        let mut vm = PlanVm::from_state(state, self.tools.clone(), self.llm.clone(), commit_graph);
        vm.recalculate_variable_refs();
        let outcome = vm.run_to_completion().await?;
        self.finish_run(&outcome).await?;
        Ok(outcome)
    }

    /// Reads `current_plan` from `commit_hash`'s snapshot and writes it as
    /// the task's `best_plan` (spec.md §4.9 `save_best_plan`).
    pub async fn save_best_plan(&self, commit_hash: &str) -> Result<()> {
        let graph = self.commit_graph().await?;
        let commit = graph.get_commit(commit_hash).await?;
        let state: VmState = serde_json::from_value(commit.vm_state)?;

        self.record.write().await.best_plan = Some(serde_json::to_value(&state.current_plan)?);
        self.persist().await
    }
}

/// Creates, loads, and lists tasks, and owns the shared collaborators every
/// [`Task`] needs (spec.md §4.9 `TaskService`).
pub struct TaskManager {
    db: DatabasePool,
    llm: Arc<dyn LlmProvider>,
    reasoning_llm: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    classifier: Arc<LabelClassifier>,
    cache: Arc<PlanCache>,
    vm_spec: Arc<str>,
}

impl TaskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DatabasePool,
        llm: Arc<dyn LlmProvider>,
        reasoning_llm: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        classifier: Arc<LabelClassifier>,
        cache: Arc<PlanCache>,
        vm_spec: impl Into<Arc<str>>,
    ) -> Self {
        Self { db, llm, reasoning_llm, tools, classifier, cache, vm_spec: vm_spec.into() }
    }

    fn wrap(&self, record: TaskRecord) -> Task {
        Task::new(
            record,
            self.db.clone(),
            self.llm.clone(),
            self.reasoning_llm.clone(),
            self.tools.clone(),
            self.classifier.clone(),
            self.cache.clone(),
            self.vm_spec.clone(),
        )
    }

    pub async fn create_task(&self, goal: &str, namespace: Option<&str>, meta: Option<Value>) -> Result<Task> {
        if let Some(namespace) = namespace {
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM namespaces WHERE name = ?")
                .bind(namespace)
                .fetch_optional(self.db.raw())
                .await
                .map_err(crate::commit_graph::CommitGraphError::from)?;
            if exists.is_none() {
                return Err(PlanEngineError::Other(format!("namespace '{namespace}' not found")));
            }
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO tasks (id, goal, status, meta, namespace, evaluation_status, human_evaluation_status, created_at, updated_at) \
             VALUES (?, ?, 'pending', ?, ?, 'NOT_EVALUATED', 'NOT_EVALUATED', ?, ?)",
        )
        .bind(id.to_string())
        .bind(goal)
        .bind(meta.as_ref().map(|v| v.to_string()))
        .bind(namespace)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(self.db.raw())
        .await
        .map_err(crate::commit_graph::CommitGraphError::from)?;

        self.get_task(id).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ? AND status != 'deleted'")
            .bind(task_id.to_string())
            .fetch_optional(self.db.raw())
            .await
            .map_err(crate::commit_graph::CommitGraphError::from)?
            .ok_or_else(|| PlanEngineError::TaskNotFound(task_id.to_string()))?;
        Ok(self.wrap(row_to_record(&row)?))
    }

    pub async fn list_tasks(&self, limit: i64, offset: i64) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status != 'deleted' ORDER BY updated_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.db.raw())
        .await
        .map_err(crate::commit_graph::CommitGraphError::from)?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn list_best_plans(&self, limit: i64, offset: i64) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE best_plan IS NOT NULL ORDER BY updated_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.db.raw())
        .await
        .map_err(crate::commit_graph::CommitGraphError::from)?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn count_best_plans(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE best_plan IS NOT NULL")
            .fetch_one(self.db.raw())
            .await
            .map_err(|e| crate::commit_graph::CommitGraphError::from(e).into())
    }

    pub async fn list_tasks_evaluation(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        evaluation_statuses: Option<&[EvaluationStatus]>,
    ) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE created_at >= ? AND created_at <= ?")
            .bind(start_time.to_rfc3339())
            .bind(end_time.to_rfc3339())
            .fetch_all(self.db.raw())
            .await
            .map_err(crate::commit_graph::CommitGraphError::from)?;

        let records: Vec<TaskRecord> = rows.iter().map(row_to_record).collect::<Result<_>>()?;
        let wanted: Vec<EvaluationStatus> = evaluation_statuses
            .map(|s| s.to_vec())
            .unwrap_or_else(|| vec![EvaluationStatus::NotEvaluated]);
        Ok(records.into_iter().filter(|r| wanted.contains(&r.evaluation_status)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelClassifier;
    use llm::MockProvider;

    async fn manager() -> TaskManager {
        let db = DatabasePool::connect("sqlite::memory:").await.unwrap();
        let llm: Arc<dyn LlmProvider> = Arc::new(MockProvider::with_response(""));
        let classifier = Arc::new(LabelClassifier::new(db.clone(), llm.clone()));
        let cache = Arc::new(PlanCache::new(db.clone()));
        TaskManager::new(db, llm.clone(), llm, ToolRegistry::new(), classifier, cache, "vm spec")
    }

    #[tokio::test]
    async fn create_and_fetch_a_task() {
        let manager = manager().await;
        let task = manager.create_task("do a thing", None, None).await.unwrap();
        let id = task.id().await;

        let fetched = manager.get_task(id).await.unwrap();
        assert_eq!(fetched.snapshot().await.goal, "do a thing");
        assert_eq!(fetched.snapshot().await.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn create_task_with_unknown_namespace_fails() {
        let manager = manager().await;
        let err = manager.create_task("goal", Some("missing"), None).await.unwrap_err();
        assert!(matches!(err, PlanEngineError::Other(_)));
    }

    #[tokio::test]
    async fn get_missing_task_is_not_found() {
        let manager = manager().await;
        let err = manager.get_task(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PlanEngineError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn execute_runs_an_unparseable_plan_to_failure() {
        let manager = manager().await;
        let task = manager.create_task("do a thing", None, None).await.unwrap();

        let err = task.execute().await.unwrap_err();
        assert!(matches!(err, PlanEngineError::PlanUnavailable(_)));
        assert_eq!(task.snapshot().await.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn save_best_plan_persists_current_plan_from_commit() {
        let manager = manager().await;
        let task = manager.create_task("do a thing", None, None).await.unwrap();
        let branch = task.get_current_branch().await.unwrap();
        let commit = task.get_answer_detail(&branch).await.unwrap();

        task.save_best_plan(&commit.commit_hash).await.unwrap();
        assert!(task.snapshot().await.best_plan.is_some());
    }
}
