//! Plan generator: turns a goal into a fresh plan by prompting the
//! reasoning LLM and handing its response to [`super::parser`].
//!
//! Grounded on `original_source/app/core/plan/generator.py`: assemble a
//! prompt from the goal, the VM specification text, the filtered tool
//! catalog, and an optional few-shot example/best-practices pair; an empty
//! response or an unparseable one both surface as `PlanUnavailable`.

use super::parser::{self, ParsedPlan};
use crate::tools::ToolRegistry;
use llm::LlmProvider;

const DEFAULT_BEST_PRACTICES: &str = "Refer to the best practices and example above.";

/// Optional few-shot material pulled from the label classifier or plan
/// cache to steer generation.
#[derive(Debug, Clone, Default)]
pub struct GenerationHints {
    pub example: Option<String>,
    pub best_practices: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("plan unavailable: {0}")]
    PlanUnavailable(String),
    #[error("llm request failed: {0}")]
    Llm(#[from] llm::LlmError),
}

pub type Result<T> = std::result::Result<T, GeneratorError>;

/// Generates a plan for `goal` using the VM specification and tool catalog
/// text the engine was configured with.
pub async fn generate_plan(
    llm: &dyn LlmProvider,
    goal: &str,
    vm_spec: &str,
    tools: &ToolRegistry,
    hints: &GenerationHints,
) -> Result<ParsedPlan> {
    let catalog = tools.describe(hints.allowed_tools.as_deref());
    let example = hints.example.as_deref().unwrap_or("(no example available)");
    let best_practices = hints.best_practices.as_deref().unwrap_or(DEFAULT_BEST_PRACTICES);

    let prompt = generation_prompt(goal, vm_spec, &catalog, example, best_practices);
    let response = llm.generate(&prompt, None).await?;

    if response.trim().is_empty() {
        return Err(GeneratorError::PlanUnavailable(
            "the language model returned an empty response".into(),
        ));
    }

    parser::parse(&response)
        .map_err(|e| GeneratorError::PlanUnavailable(format!("{e}: {response}")))
}

fn generation_prompt(
    goal: &str,
    vm_spec: &str,
    tool_catalog: &str,
    example: &str,
    best_practices: &str,
) -> String {
    format!(
        "You are producing a plan for the following goal.\n\n\
         Goal: {goal}\n\n\
         VM specification:\n{vm_spec}\n\n\
         Available tools:\n{tool_catalog}\n\n\
         Example plan:\n{example}\n\n\
         Best practices:\n{best_practices}\n\n\
         Respond with <think>...</think><answer>```json [ ... ] ```</answer>."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm::MockProvider;

    fn sample_response() -> String {
        r#"<think>because</think><answer>```json
[{"seq_no": 0, "type": "assign", "parameters": {"final_answer": "done"}}]
```</answer>"#
            .to_string()
    }

    #[tokio::test]
    async fn generates_and_parses_a_plan() {
        let llm = MockProvider::with_response(sample_response());
        let tools = ToolRegistry::new();
        let hints = GenerationHints::default();

        let parsed = generate_plan(&llm, "do a thing", "spec text", &tools, &hints)
            .await
            .unwrap();
        assert_eq!(parsed.plan.len(), 1);
    }

    #[tokio::test]
    async fn empty_response_is_plan_unavailable() {
        let llm = MockProvider::with_response("");
        let tools = ToolRegistry::new();
        let hints = GenerationHints::default();

        let err = generate_plan(&llm, "do a thing", "spec text", &tools, &hints)
            .await
            .unwrap_err();
        assert!(matches!(err, GeneratorError::PlanUnavailable(_)));
    }

    #[tokio::test]
    async fn unparseable_response_is_plan_unavailable() {
        let llm = MockProvider::with_response("no plan here at all");
        let tools = ToolRegistry::new();
        let hints = GenerationHints::default();

        let err = generate_plan(&llm, "do a thing", "spec text", &tools, &hints)
            .await
            .unwrap_err();
        assert!(matches!(err, GeneratorError::PlanUnavailable(_)));
    }
}
