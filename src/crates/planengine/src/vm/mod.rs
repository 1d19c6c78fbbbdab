//! Plan VM: the interpreter that advances one task's state one step at a
//! time (spec.md §4.4).
//!
//! Grounded on `original_source/app/services/vm.py`: the same step state
//! machine (`pending -> submitted/running -> successful/failed`), the same
//! lookahead-concurrency discovery over a contiguous run of `calling`
//! steps, and the same truncated-preview commit messages
//! (`VARIABLE_PREVIEW_LENGTH`).

use crate::commit_graph::{CommitGraph, CommitMessage, CommitType};
use crate::error::{PlanEngineError, Result};
use crate::instructions::{self, HandlerContext, StepFailure, StepOutcome};
use crate::plan::{Plan, PlanStep, StepType};
use crate::tools::ToolRegistry;
use crate::vars::VariableStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

const PREVIEW_LEN: usize = 50;

/// The snapshot stored inside every commit (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmState {
    pub goal: String,
    pub current_plan: Plan,
    pub reasoning: String,
    pub program_counter: i64,
    pub goal_completed: bool,
    pub errors: Vec<String>,
    pub msgs: Vec<String>,
    pub variables: HashMap<String, Value>,
    pub variables_refs: HashMap<String, i64>,
}

impl VmState {
    pub fn new(goal: impl Into<String>, plan: Plan, reasoning: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            current_plan: plan,
            reasoning: reasoning.into(),
            program_counter: 0,
            goal_completed: false,
            errors: Vec::new(),
            msgs: Vec::new(),
            variables: HashMap::new(),
            variables_refs: HashMap::new(),
        }
    }
}

/// A step that advanced the program counter and wrote a commit.
#[derive(Debug, Clone)]
pub struct StepAdvance {
    pub commit_hash: String,
    pub seq_no: i64,
    pub goal_completed: bool,
}

/// A step whose handler failed; a commit was still written.
#[derive(Debug, Clone)]
pub struct StepAdvanceFailure {
    pub commit_hash: String,
    pub seq_no: i64,
    pub error_message: String,
}

/// Outcome of one `step()` call that did attempt a step (as opposed to the
/// bounds-check failure, which is a [`PlanEngineError`]).
pub type StepAdvanceResult = std::result::Result<StepAdvance, StepAdvanceFailure>;

/// Terminal outcome of running a VM to completion.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { commit_hash: String },
    Failed { commit_hash: String, error_message: String },
    /// The plan ran out of steps without ever installing `final_answer`.
    Exhausted,
}

enum StepCell {
    Pending,
    Submitted(JoinHandle<instructions::StepResult>),
}

/// Interpreter for one task's plan, bound to a commit graph and tool set.
pub struct PlanVm {
    state: VmState,
    vars: Arc<VariableStore>,
    tools: ToolRegistry,
    llm: Arc<dyn llm::LlmProvider>,
    commit_graph: Arc<dyn CommitGraph>,
    steps: Vec<StepCell>,
}

impl PlanVm {
    /// Start a fresh VM for `plan` with empty variable state.
    pub fn new(
        goal: impl Into<String>,
        plan: Plan,
        reasoning: impl Into<String>,
        tools: ToolRegistry,
        llm: Arc<dyn llm::LlmProvider>,
        commit_graph: Arc<dyn CommitGraph>,
    ) -> Self {
        Self::from_state(VmState::new(goal, plan, reasoning), tools, llm, commit_graph)
    }

    /// Resume a VM from a previously committed snapshot.
    pub fn from_state(
        state: VmState,
        tools: ToolRegistry,
        llm: Arc<dyn llm::LlmProvider>,
        commit_graph: Arc<dyn CommitGraph>,
    ) -> Self {
        let vars = VariableStore::new();
        vars.set_all(state.variables.clone(), state.variables_refs.clone());
        Self {
            state,
            vars: Arc::new(vars),
            tools,
            llm,
            commit_graph,
            steps: Vec::new(),
        }
    }

    pub fn state(&self) -> &VmState {
        &self.state
    }

    /// Reverse-scans for the plan's final-answer producer (spec.md §4.4).
    pub fn parse_final_answer(&self) -> Option<&PlanStep> {
        self.state.current_plan.parse_final_answer()
    }

    /// Producing `seq_no`s for each requested variable name.
    pub fn parse_dependencies(&self, names: &[String]) -> HashMap<String, Vec<i64>> {
        self.state.current_plan.parse_dependencies(names)
    }

    /// Resets every known variable's count to zero and re-scans the plan
    /// from `program_counter` forward, counting one reference per
    /// `${name}` occurrence (spec.md §4.4 Recalculation).
    pub fn recalculate_variable_refs(&self) {
        let from = self.state.program_counter.max(0) as usize;
        let counts = self.state.current_plan.count_refs_from(from);
        for name in self.vars.get_all().into_keys() {
            self.vars.set_reference_count(&name, *counts.get(&name).unwrap_or(&0));
        }
    }

    /// Advance one step. The outer `Result` fails only when the program
    /// counter cannot be interpreted at all (out of range); everything a
    /// step handler can fail on is represented by the inner
    /// [`StepAdvanceResult`], which still carries a written commit hash.
    pub async fn step(&mut self) -> Result<StepAdvanceResult> {
        self.ensure_materialized();

        let pc = self.state.program_counter;
        if pc < 0 || pc as usize >= self.state.current_plan.len() {
            return Err(PlanEngineError::StepFailed {
                seq_no: -1,
                instruction: "vm".into(),
                message: "program_counter_out_of_range".into(),
            });
        }
        let idx = pc as usize;
        let seq_no = self.state.current_plan.steps[idx].seq_no;
        let step_type = self.state.current_plan.steps[idx].step_type;

        if matches!(self.steps[idx], StepCell::Pending) && step_type != StepType::Jmp {
            for run_idx in self.discover_run(idx) {
                if matches!(self.steps[run_idx], StepCell::Pending) {
                    self.submit(run_idx);
                }
            }
        }

        match self.resolve(idx).await {
            Ok(outcome) => Ok(Ok(self.install_success(idx, seq_no, outcome).await?)),
            Err(failure) => Ok(Err(self.install_failure(seq_no, failure).await?)),
        }
    }

    /// Step until `final_answer` is installed, a handler fails, or the plan
    /// runs out of steps.
    pub async fn run_to_completion(&mut self) -> Result<RunOutcome> {
        loop {
            match self.step().await {
                Ok(Ok(advance)) => {
                    if advance.goal_completed {
                        return Ok(RunOutcome::Completed { commit_hash: advance.commit_hash });
                    }
                }
                Ok(Err(failure)) => {
                    return Ok(RunOutcome::Failed {
                        commit_hash: failure.commit_hash,
                        error_message: failure.error_message,
                    });
                }
                Err(PlanEngineError::StepFailed { message, .. })
                    if message == "program_counter_out_of_range" =>
                {
                    return Ok(RunOutcome::Exhausted);
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn ensure_materialized(&mut self) {
        if self.steps.len() != self.state.current_plan.len() {
            self.steps = (0..self.state.current_plan.len()).map(|_| StepCell::Pending).collect();
        }
    }

    /// Maximal contiguous run of `calling` steps starting at `from_idx`,
    /// where every step after the first has all its `${...}` references
    /// already present in the variable store (spec.md §4.4 Concurrency
    /// discovery).
    fn discover_run(&self, from_idx: usize) -> Vec<usize> {
        let mut run = Vec::new();
        let mut idx = from_idx;
        while idx < self.state.current_plan.len() {
            let step = &self.state.current_plan.steps[idx];
            if step.step_type != StepType::Calling {
                break;
            }
            if idx != from_idx && !self.deps_satisfied(step) {
                break;
            }
            run.push(idx);
            idx += 1;
        }
        run
    }

    fn deps_satisfied(&self, step: &PlanStep) -> bool {
        names_referenced(&step.parameters)
            .iter()
            .all(|name| self.vars.get(name).is_some())
    }

    fn submit(&mut self, idx: usize) {
        let step = self.state.current_plan.steps[idx].clone();
        let vars = self.vars.clone();
        let tools = self.tools.clone();
        let llm = self.llm.clone();
        let handle = tokio::spawn(async move {
            let ctx = HandlerContext { vars: &vars, tools: &tools, llm: llm.as_ref() };
            instructions::dispatch(&step, &ctx).await
        });
        self.steps[idx] = StepCell::Submitted(handle);
    }

    async fn resolve(&mut self, idx: usize) -> instructions::StepResult {
        match std::mem::replace(&mut self.steps[idx], StepCell::Pending) {
            StepCell::Pending => {
                let step = self.state.current_plan.steps[idx].clone();
                let ctx = HandlerContext { vars: self.vars.as_ref(), tools: &self.tools, llm: self.llm.as_ref() };
                instructions::dispatch(&step, &ctx).await
            }
            StepCell::Submitted(handle) => handle.await.unwrap_or_else(|join_err| {
                Err(StepFailure {
                    error_message: format!("step task panicked: {join_err}"),
                    instruction: "vm".into(),
                    params: Value::Null,
                })
            }),
        }
    }

    async fn install_success(&mut self, idx: usize, seq_no: i64, outcome: StepOutcome) -> Result<StepAdvance> {
        let step_params = self.state.current_plan.steps[idx].parameters.clone();
        let instruction = instruction_name(self.state.current_plan.steps[idx].step_type);
        let output_preview;

        match outcome {
            StepOutcome::Outputs(outputs) => {
                let refs = self.state.current_plan.count_refs_from(idx + 1);
                let mut installed = serde_json::Map::new();
                for (name, value) in outputs {
                    if name == "__reasoning_msg" {
                        if let Value::String(s) = &value {
                            self.state.msgs.push(s.clone());
                        }
                        continue;
                    }
                    if name == "final_answer" {
                        self.state.goal_completed = true;
                    }
                    let ref_count = *refs.get(&name).unwrap_or(&0);
                    self.vars.set(&name, value.clone(), ref_count);
                    installed.insert(name, value);
                }
                output_preview = json_preview(&Value::Object(installed));
                self.state.program_counter = idx as i64 + 1;
            }
            StepOutcome::Jump(target) => {
                let target_idx = self.state.current_plan.find_step_index(target).ok_or_else(|| {
                    PlanEngineError::StepFailed {
                        seq_no,
                        instruction: instruction.to_string(),
                        message: format!("jump target seq_no {target} not found in plan"),
                    }
                })?;
                self.state.program_counter = target_idx as i64;
                output_preview = json_preview(&serde_json::json!({ "target_seq": target }));
            }
        }

        self.vars.garbage_collect();
        self.sync_state_from_vars();

        let message = CommitMessage {
            commit_type: CommitType::StepExecution,
            seq_no: Some(seq_no),
            description: format!("{instruction} step {seq_no}"),
            input_parameters: json_preview(&step_params),
            output_variables: output_preview,
            execution_error: None,
        };
        let commit_hash = self.write_commit(message).await?;

        Ok(StepAdvance { commit_hash, seq_no, goal_completed: self.state.goal_completed })
    }

    async fn install_failure(&mut self, seq_no: i64, failure: StepFailure) -> Result<StepAdvanceFailure> {
        self.vars.garbage_collect();
        self.sync_state_from_vars();
        self.state.errors.push(failure.error_message.clone());

        let message = CommitMessage {
            commit_type: CommitType::StepExecution,
            seq_no: Some(seq_no),
            description: format!("{} step {} failed", failure.instruction, seq_no),
            input_parameters: json_preview(&failure.params),
            output_variables: Value::Null,
            execution_error: Some(failure.error_message.clone()),
        };
        let commit_hash = self.write_commit(message).await?;

        Ok(StepAdvanceFailure { commit_hash, seq_no, error_message: failure.error_message })
    }

    fn sync_state_from_vars(&mut self) {
        self.state.variables = self.vars.get_all();
        self.state.variables_refs = self.vars.get_all_refs();
    }

    async fn write_commit(&self, message: CommitMessage) -> Result<String> {
        let snapshot = serde_json::to_value(&self.state)?;
        self.commit_graph.update_state(snapshot).await?;
        Ok(self.commit_graph.commit_changes(message).await?)
    }
}

fn instruction_name(step_type: StepType) -> &'static str {
    match step_type {
        StepType::Calling => "calling",
        StepType::Jmp => "jmp",
        StepType::Assign => "assign",
        StepType::Reasoning => "reasoning",
        StepType::Unknown => "calling",
    }
}

fn json_preview(value: &Value) -> Value {
    let s = value.to_string();
    if s.chars().count() > PREVIEW_LEN {
        let truncated: String = s.chars().take(PREVIEW_LEN).collect();
        Value::String(format!("{truncated}\u{2026}"))
    } else {
        value.clone()
    }
}

fn names_referenced(value: &Value) -> std::collections::HashSet<String> {
    let mut out = std::collections::HashSet::new();
    collect_names(value, &mut out);
    out
}

fn collect_names(value: &Value, out: &mut std::collections::HashSet<String>) {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let pattern = PATTERN.get_or_init(|| regex::Regex::new(r"\$\{(\w+)(?:\.\w+)?\}").expect("static regex"));
    match value {
        Value::String(s) => {
            for caps in pattern.captures_iter(s) {
                out.insert(caps[1].to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_names(item, out);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_names(v, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_graph::filesystem::FilesystemCommitGraph;
    use crate::plan::{PlanStep, StepType};
    use crate::tools::{Tool, ToolParam};
    use async_trait::async_trait;
    use llm::MockProvider;
    use serde_json::json;
    use std::collections::HashMap as Map;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "tool_echo"
        }
        fn description(&self) -> &str {
            "Echoes its `msg` argument."
        }
        fn params(&self) -> &[ToolParam] {
            static PARAMS: std::sync::OnceLock<Vec<ToolParam>> = std::sync::OnceLock::new();
            PARAMS.get_or_init(|| vec![ToolParam { name: "msg".into(), required: true, type_hint: "string".into() }])
        }
        async fn call(&self, args: Map<String, Value>) -> anyhow::Result<Value> {
            Ok(args.get("msg").cloned().unwrap_or(Value::Null))
        }
    }

    fn step(seq_no: i64, step_type: StepType, parameters: Value) -> PlanStep {
        PlanStep { seq_no, step_type, parameters }
    }

    async fn graph() -> Arc<dyn CommitGraph> {
        let dir = tempfile::tempdir().unwrap().into_path();
        let fs = FilesystemCommitGraph::open(dir).await.unwrap();
        Arc::new(fs)
    }

    #[tokio::test]
    async fn conditional_jump_reaches_expected_branch() {
        let plan = Plan::new(vec![
            step(0, StepType::Reasoning, json!({"chain_of_thoughts": "x", "dependency_analysis": "y"})),
            step(1, StepType::Jmp, json!({"condition_prompt": "Is 2>1?", "jump_if_true": 2, "jump_if_false": 3})),
            step(2, StepType::Assign, json!({"final_answer": "yes"})),
            step(3, StepType::Assign, json!({"final_answer": "no"})),
        ]);
        let llm: Arc<dyn llm::LlmProvider> =
            Arc::new(MockProvider::with_response(r#"{"result": true, "explanation": ""}"#));
        let mut vm = PlanVm::new("goal", plan, "", ToolRegistry::new(), llm, graph().await);

        let outcome = vm.run_to_completion().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(vm.state().variables.get("final_answer"), Some(&json!("yes")));
        assert!(vm.state().goal_completed);
    }

    #[tokio::test]
    async fn variable_flows_from_calling_into_assign() {
        let plan = Plan::new(vec![
            step(0, StepType::Calling, json!({"tool_name": "tool_echo", "tool_params": {"msg": "hello"}, "output_vars": ["x"]})),
            step(1, StepType::Assign, json!({"final_answer": "${x}"})),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(Echo)).unwrap();
        let llm: Arc<dyn llm::LlmProvider> = Arc::new(MockProvider::with_response(""));
        let commit_graph = graph().await;
        let mut vm = PlanVm::new("goal", plan, "", tools, llm, commit_graph.clone());

        let outcome = vm.run_to_completion().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(vm.state().variables.get("final_answer"), Some(&json!("hello")));

        let commits = commit_graph.get_commit_hashes("main").await.unwrap();
        assert_eq!(commits.len(), 3);
    }

    #[tokio::test]
    async fn calling_unregistered_tool_writes_failure_commit() {
        let plan = Plan::new(vec![step(
            0,
            StepType::Calling,
            json!({"tool_name": "does_not_exist", "tool_params": {}, "output_vars": ["x"]}),
        )]);
        let llm: Arc<dyn llm::LlmProvider> = Arc::new(MockProvider::with_response(""));
        let commit_graph = graph().await;
        let mut vm = PlanVm::new("goal", plan, "", ToolRegistry::new(), llm, commit_graph.clone());

        let outcome = vm.run_to_completion().await.unwrap();
        match outcome {
            RunOutcome::Failed { commit_hash, .. } => {
                let commit = commit_graph.get_commit(&commit_hash).await.unwrap();
                assert_eq!(commit.message.commit_type, CommitType::StepExecution);
                assert!(commit.message.execution_error.is_some());
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn program_counter_out_of_range_on_empty_plan() {
        let plan = Plan::new(vec![]);
        let llm: Arc<dyn llm::LlmProvider> = Arc::new(MockProvider::with_response(""));
        let mut vm = PlanVm::new("goal", plan, "", ToolRegistry::new(), llm, graph().await);

        let outcome = vm.run_to_completion().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Exhausted));
    }

    #[tokio::test]
    async fn lookahead_submits_a_alone_then_b_and_c_together() {
        let plan = Plan::new(vec![
            step(0, StepType::Calling, json!({"tool_name": "tool_echo", "tool_params": {"msg": "a-out"}, "output_vars": ["a"]})),
            step(1, StepType::Calling, json!({"tool_name": "tool_echo", "tool_params": {"msg": "${a}"}, "output_vars": ["b"]})),
            step(2, StepType::Calling, json!({"tool_name": "tool_echo", "tool_params": {"msg": "c-out"}, "output_vars": ["c"]})),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(Echo)).unwrap();
        let llm: Arc<dyn llm::LlmProvider> = Arc::new(MockProvider::with_response(""));
        let mut vm = PlanVm::new("goal", plan, "", tools, llm, graph().await);

        // Step 0: only A is ready (B depends on a, unmet).
        vm.step().await.unwrap().unwrap();
        assert!(matches!(vm.steps[1], StepCell::Pending));
        assert!(matches!(vm.steps[2], StepCell::Pending));

        // Step 1: now a exists, so both B and C are submitted together.
        vm.step().await.unwrap().unwrap();
        assert!(matches!(vm.steps[2], StepCell::Submitted(_)));

        let outcome = vm.run_to_completion().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Exhausted));
        assert_eq!(vm.state().variables.get("c"), Some(&json!("c-out")));
    }

    #[test]
    fn recalculate_variable_refs_counts_remaining_occurrences() {
        let plan = Plan::new(vec![
            step(0, StepType::Assign, json!({"x": "1"})),
            step(1, StepType::Assign, json!({"y": "${x} and ${x}"})),
        ]);
        let llm: Arc<dyn llm::LlmProvider> = Arc::new(MockProvider::with_response(""));
        let vm = PlanVm::new("goal", plan, "", ToolRegistry::new(), llm, Arc::new(NoopGraphForSync));
        vm.vars.set("x", json!("1"), 0);
        vm.recalculate_variable_refs();
        assert_eq!(vm.vars.get_all_refs().get("x"), Some(&2));
    }

    struct NoopGraphForSync;

    #[async_trait]
    impl CommitGraph for NoopGraphForSync {
        async fn list_branches(&self) -> crate::commit_graph::Result<Vec<crate::commit_graph::BranchInfo>> {
            unreachable!()
        }
        async fn checkout_branch(&self, _name: &str) -> crate::commit_graph::Result<()> {
            unreachable!()
        }
        async fn delete_branch(&self, _name: &str) -> crate::commit_graph::Result<()> {
            unreachable!()
        }
        async fn checkout_branch_from_commit(&self, _name: &str, _hash: &str) -> crate::commit_graph::Result<()> {
            unreachable!()
        }
        async fn get_current_branch(&self) -> crate::commit_graph::Result<String> {
            unreachable!()
        }
        async fn get_current_commit_hash(&self) -> crate::commit_graph::Result<String> {
            unreachable!()
        }
        async fn get_parent_commit_hash(&self, _hash: &str) -> crate::commit_graph::Result<Option<String>> {
            unreachable!()
        }
        async fn get_commit_hashes(&self, _branch: &str) -> crate::commit_graph::Result<Vec<String>> {
            unreachable!()
        }
        async fn get_commits(&self, _branch: &str) -> crate::commit_graph::Result<Vec<crate::commit_graph::Commit>> {
            unreachable!()
        }
        async fn get_commit(&self, _hash: &str) -> crate::commit_graph::Result<crate::commit_graph::Commit> {
            unreachable!()
        }
        async fn get_latest_commit(&self, _branch: &str) -> crate::commit_graph::Result<crate::commit_graph::Commit> {
            unreachable!()
        }
        async fn load_state(&self, _hash: &str) -> crate::commit_graph::Result<Value> {
            unreachable!()
        }
        async fn get_all_commits(&self) -> crate::commit_graph::Result<Vec<crate::commit_graph::Commit>> {
            unreachable!()
        }
        async fn update_state(&self, _vm_state: Value) -> crate::commit_graph::Result<()> {
            unreachable!()
        }
        async fn commit_changes(&self, _message: CommitMessage) -> crate::commit_graph::Result<String> {
            unreachable!()
        }
        async fn get_state_diff(&self, _hash: &str) -> crate::commit_graph::Result<crate::commit_graph::StateDiff> {
            unreachable!()
        }
    }
}
