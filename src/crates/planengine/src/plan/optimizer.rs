//! Plan optimizer: two ways to revise an existing plan without starting
//! generation over from nothing (spec.md §4.6).
//!
//! Grounded on `original_source/app/core/plan/optimizer.py`:
//! `optimize_whole_plan` replaces the plan entirely, `optimize_partial_plan`
//! keeps everything up to `program_counter` untouched and only lets the LLM
//! rewrite the tail.

use super::parser::{self, ParsedPlan};
use super::{Plan, PlanStep};
use crate::tools::ToolRegistry;
use llm::LlmProvider;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    #[error("plan update unavailable: {0}")]
    Unavailable(String),
    #[error("updated plan changed a step before program_counter {0}")]
    PrefixViolated(i64),
    #[error("llm request failed: {0}")]
    Llm(#[from] llm::LlmError),
}

pub type Result<T> = std::result::Result<T, OptimizerError>;

fn suggestion_text(suggestion: &Value) -> String {
    match suggestion {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fully replaces `plan` given the evaluator's `suggestion` and any fixed
/// user instructions. The previous plan is supplied only as prompt context;
/// nothing about it constrains the result.
pub async fn optimize_whole_plan(
    llm: &dyn LlmProvider,
    goal: &str,
    plan: &Plan,
    suggestion: &Value,
    user_instructions: &str,
    vm_spec: &str,
    tools: &ToolRegistry,
    allowed_tools: Option<&[String]>,
) -> Result<ParsedPlan> {
    let catalog = tools.describe(allowed_tools);
    let plan_json = serde_json::to_string_pretty(plan).unwrap_or_default();
    let prompt = format!(
        "Replace the plan below entirely to better achieve the goal.\n\n\
         Goal: {goal}\n\n\
         Current plan:\n{plan_json}\n\n\
         Suggestion: {suggestion}\n\n\
         Fixed user instructions: {user_instructions}\n\n\
         VM specification:\n{vm_spec}\n\n\
         Available tools:\n{catalog}\n\n\
         Respond with <think>...</think><answer>```json [ ... ] ```</answer>.",
        suggestion = suggestion_text(suggestion),
    );

    let response = llm.generate(&prompt, None).await?;
    if response.trim().is_empty() {
        return Err(OptimizerError::Unavailable(
            "the language model returned an empty response".into(),
        ));
    }
    parser::parse(&response).map_err(|e| OptimizerError::Unavailable(format!("{e}: {response}")))
}

/// Rewrites only the steps from `program_counter` onward; steps before it
/// must reappear unchanged in the returned plan, byte for byte.
pub async fn optimize_partial_plan(
    llm: &dyn LlmProvider,
    goal: &str,
    program_counter: i64,
    plan: &Plan,
    reasoning: &str,
    suggestion: &Value,
    vm_spec: &str,
    tools: &ToolRegistry,
    allowed_tools: Option<&[String]>,
) -> Result<Plan> {
    let catalog = tools.describe(allowed_tools);
    let plan_json = serde_json::to_string_pretty(plan).unwrap_or_default();
    let prompt = format!(
        "Update the plan below starting at program counter {program_counter}. Steps \
         before this point are already executed and must be repeated unchanged; \
         only steps from this point on may be rewritten.\n\n\
         Goal: {goal}\n\n\
         Current plan:\n{plan_json}\n\n\
         Reasoning so far: {reasoning}\n\n\
         Suggestion: {suggestion}\n\n\
         VM specification:\n{vm_spec}\n\n\
         Available tools:\n{catalog}\n\n\
         Respond with <think>...</think><answer>```json [ ... ] ```</answer>.",
        suggestion = suggestion_text(suggestion),
    );

    let response = llm.generate(&prompt, None).await?;
    if response.trim().is_empty() {
        return Err(OptimizerError::Unavailable(
            "the language model returned an empty response".into(),
        ));
    }
    let parsed =
        parser::parse(&response).map_err(|e| OptimizerError::Unavailable(format!("{e}: {response}")))?;

    verify_prefix_preserved(plan, &parsed.plan, program_counter)?;
    Ok(parsed.plan)
}

/// Produces a single replacement step for `seq_no`, given the full plan as
/// context and a suggestion for what should change. The model is asked to
/// return a one-element plan array; used by step-level optimization, as
/// distinct from whole- or partial-plan rewrites.
pub async fn optimize_single_step(
    llm: &dyn LlmProvider,
    goal: &str,
    plan: &Plan,
    seq_no: i64,
    suggestion: &Value,
    vm_spec: &str,
    tools: &ToolRegistry,
    allowed_tools: Option<&[String]>,
) -> Result<PlanStep> {
    let catalog = tools.describe(allowed_tools);
    let plan_json = serde_json::to_string_pretty(plan).unwrap_or_default();
    let prompt = format!(
        "Replace only step {seq_no} in the plan below; every other step stays as is. \
         Respond with a plan array containing just the one replacement step.\n\n\
         Goal: {goal}\n\n\
         Current plan:\n{plan_json}\n\n\
         Suggestion: {suggestion}\n\n\
         VM specification:\n{vm_spec}\n\n\
         Available tools:\n{catalog}\n\n\
         Respond with <think>...</think><answer>```json [ ... ] ```</answer>.",
        suggestion = suggestion_text(suggestion),
    );

    let response = llm.generate(&prompt, None).await?;
    if response.trim().is_empty() {
        return Err(OptimizerError::Unavailable(
            "the language model returned an empty response".into(),
        ));
    }
    let parsed =
        parser::parse(&response).map_err(|e| OptimizerError::Unavailable(format!("{e}: {response}")))?;
    parsed
        .plan
        .step_at(0)
        .cloned()
        .ok_or_else(|| OptimizerError::Unavailable("no replacement step returned".into()))
}

fn verify_prefix_preserved(original: &Plan, updated: &Plan, program_counter: i64) -> Result<()> {
    let prefix_len = original
        .steps
        .iter()
        .take_while(|s| s.seq_no < program_counter)
        .count();

    let original_prefix: &[PlanStep] = &original.steps[..prefix_len.min(original.steps.len())];
    if updated.steps.len() < original_prefix.len() {
        return Err(OptimizerError::PrefixViolated(program_counter));
    }
    if &updated.steps[..original_prefix.len()] != original_prefix {
        return Err(OptimizerError::PrefixViolated(program_counter));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::StepType;
    use llm::MockProvider;
    use serde_json::json;

    fn step(seq_no: i64, step_type: StepType, parameters: Value) -> PlanStep {
        PlanStep { seq_no, step_type, parameters }
    }

    fn original_plan() -> Plan {
        Plan::new(vec![
            step(0, StepType::Reasoning, json!({})),
            step(1, StepType::Assign, json!({"x": "1"})),
            step(2, StepType::Assign, json!({"final_answer": "old"})),
        ])
    }

    fn response_with(steps_json: &str) -> String {
        format!("<answer>```json\n{steps_json}\n```</answer>")
    }

    #[tokio::test]
    async fn whole_plan_update_returns_the_replacement() {
        let llm = MockProvider::with_response(response_with(
            r#"[{"seq_no": 0, "type": "assign", "parameters": {"final_answer": "new"}}]"#,
        ));
        let tools = ToolRegistry::new();
        let parsed = optimize_whole_plan(
            &llm,
            "goal",
            &original_plan(),
            &json!("try again"),
            "",
            "spec",
            &tools,
            None,
        )
        .await
        .unwrap();
        assert_eq!(parsed.plan.len(), 1);
    }

    #[tokio::test]
    async fn partial_update_accepts_a_preserved_prefix() {
        let plan = original_plan();
        let response = response_with(
            r#"[{"seq_no": 0, "type": "reasoning", "parameters": {}},
                {"seq_no": 1, "type": "assign", "parameters": {"x": "1"}},
                {"seq_no": 2, "type": "assign", "parameters": {"final_answer": "new"}}]"#,
        );
        let llm = MockProvider::with_response(response);
        let tools = ToolRegistry::new();
        let updated = optimize_partial_plan(
            &llm,
            "goal",
            2,
            &plan,
            "",
            &json!("try again"),
            "spec",
            &tools,
            None,
        )
        .await
        .unwrap();
        assert_eq!(updated.steps[2].parameters["final_answer"], "new");
    }

    #[tokio::test]
    async fn single_step_update_returns_the_replacement_step() {
        let llm = MockProvider::with_response(response_with(
            r#"[{"seq_no": 1, "type": "assign", "parameters": {"x": "2"}}]"#,
        ));
        let tools = ToolRegistry::new();
        let step = optimize_single_step(
            &llm,
            "goal",
            &original_plan(),
            1,
            &json!("use a different value"),
            "spec",
            &tools,
            None,
        )
        .await
        .unwrap();
        assert_eq!(step.parameters["x"], "2");
    }

    #[tokio::test]
    async fn partial_update_rejects_a_changed_prefix() {
        let plan = original_plan();
        let response = response_with(
            r#"[{"seq_no": 0, "type": "reasoning", "parameters": {"changed": true}},
                {"seq_no": 2, "type": "assign", "parameters": {"final_answer": "new"}}]"#,
        );
        let llm = MockProvider::with_response(response);
        let tools = ToolRegistry::new();
        let err = optimize_partial_plan(
            &llm,
            "goal",
            2,
            &plan,
            "",
            &json!("try again"),
            "spec",
            &tools,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OptimizerError::PrefixViolated(2)));
    }
}
