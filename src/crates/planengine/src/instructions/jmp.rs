//! `jmp` handler: conditional (LLM-judged) and unconditional jumps
//! (spec.md §4.2).

use super::{find_balanced_object, resolve, HandlerContext, StepFailure, StepOutcome, StepResult};
use serde_json::Value;

const DECISION_INSTRUCTION: &str =
    "\n\nRespond with a single JSON object of the form {\"result\": true|false, \"explanation\": \"...\"}.";

pub async fn handle(params: &Value, ctx: &HandlerContext<'_>) -> StepResult {
    if let Some(target) = params.get("target_seq") {
        let target = target.as_i64().ok_or_else(|| StepFailure {
            error_message: "target_seq must be an integer".into(),
            instruction: "jmp".into(),
            params: params.clone(),
        })?;
        return Ok(StepOutcome::Jump(target));
    }

    let (jump_if_true, jump_if_false) = match (
        params.get("jump_if_true").and_then(Value::as_i64),
        params.get("jump_if_false").and_then(Value::as_i64),
    ) {
        (Some(t), Some(f)) => (t, f),
        _ => {
            return Err(StepFailure {
                error_message: "conditional jmp requires integer jump_if_true and jump_if_false"
                    .into(),
                instruction: "jmp".into(),
                params: params.clone(),
            })
        }
    };

    let condition_prompt = params
        .get("condition_prompt")
        .cloned()
        .unwrap_or(Value::String(String::new()));
    let condition_prompt = resolve(&condition_prompt, ctx.vars);
    let context_value = params.get("context").cloned().map(|v| resolve(&v, ctx.vars));

    let prompt = format!(
        "{}{}",
        condition_prompt.as_str().unwrap_or_default(),
        DECISION_INSTRUCTION
    );
    let context_text = context_value
        .as_ref()
        .and_then(|v| v.as_str().map(|s| s.to_string()));

    let response = ctx
        .llm
        .generate(&prompt, context_text.as_deref())
        .await
        .map_err(|e| StepFailure {
            error_message: format!("llm call failed: {e}"),
            instruction: "jmp".into(),
            params: params.clone(),
        })?;

    let object_text = find_balanced_object(&response).ok_or_else(|| StepFailure {
        error_message: "no JSON object found in jmp decision response".into(),
        instruction: "jmp".into(),
        params: params.clone(),
    })?;

    let decision: Value = serde_json::from_str(object_text).map_err(|e| StepFailure {
        error_message: format!("malformed jmp decision JSON: {e}"),
        instruction: "jmp".into(),
        params: params.clone(),
    })?;

    let result = decision.get("result").and_then(Value::as_bool).ok_or_else(|| StepFailure {
        error_message: "jmp decision missing boolean 'result'".into(),
        instruction: "jmp".into(),
        params: params.clone(),
    })?;

    Ok(StepOutcome::Jump(if result { jump_if_true } else { jump_if_false }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolRegistry;
    use crate::vars::VariableStore;
    use llm::MockProvider;
    use serde_json::json;

    #[tokio::test]
    async fn unconditional_jump_returns_target() {
        let vars = VariableStore::new();
        let tools = ToolRegistry::new();
        let provider = MockProvider::with_response("");
        let ctx = HandlerContext { vars: &vars, tools: &tools, llm: &provider };

        let result = handle(&json!({"target_seq": 7}), &ctx).await.unwrap();
        assert!(matches!(result, StepOutcome::Jump(7)));
    }

    #[tokio::test]
    async fn conditional_jump_true_goes_to_jump_if_true() {
        let vars = VariableStore::new();
        let tools = ToolRegistry::new();
        let provider = MockProvider::with_response(r#"{"result": true, "explanation": ""}"#);
        let ctx = HandlerContext { vars: &vars, tools: &tools, llm: &provider };

        let result = handle(
            &json!({"condition_prompt": "Is 2>1?", "jump_if_true": 2, "jump_if_false": 3}),
            &ctx,
        )
        .await
        .unwrap();
        assert!(matches!(result, StepOutcome::Jump(2)));
    }

    #[tokio::test]
    async fn identical_targets_still_decide_and_advance() {
        let vars = VariableStore::new();
        let tools = ToolRegistry::new();
        let provider = MockProvider::with_response(r#"{"result": false, "explanation": ""}"#);
        let ctx = HandlerContext { vars: &vars, tools: &tools, llm: &provider };

        let result = handle(
            &json!({"condition_prompt": "x", "jump_if_true": 4, "jump_if_false": 4}),
            &ctx,
        )
        .await
        .unwrap();
        assert!(matches!(result, StepOutcome::Jump(4)));
    }

    #[tokio::test]
    async fn malformed_json_fails() {
        let vars = VariableStore::new();
        let tools = ToolRegistry::new();
        let provider = MockProvider::with_response("not json");
        let ctx = HandlerContext { vars: &vars, tools: &tools, llm: &provider };

        let result = handle(
            &json!({"condition_prompt": "x", "jump_if_true": 1, "jump_if_false": 2}),
            &ctx,
        )
        .await;
        assert!(result.is_err());
    }
}
