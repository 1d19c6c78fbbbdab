//! `assign` handler: resolves each `name -> expression` pair. The VM installs
//! the resulting outputs with the correct reference count (spec.md §4.2,
//! §4.4 garbage collection).

use super::{resolve_object, HandlerContext, StepOutcome, StepResult};
use serde_json::Value;

pub fn handle(params: &Value, ctx: &HandlerContext<'_>) -> StepResult {
    let resolved = match params.as_object() {
        Some(map) => resolve_object(map, ctx.vars),
        None => serde_json::Map::new(),
    };
    Ok(StepOutcome::Outputs(resolved.into_iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolRegistry;
    use crate::vars::VariableStore;
    use llm::MockProvider;
    use serde_json::json;

    #[test]
    fn resolves_each_expression() {
        let vars = VariableStore::new();
        vars.set("x", json!("hello"), 1);
        let tools = ToolRegistry::new();
        let provider = MockProvider::with_response("");
        let ctx = HandlerContext { vars: &vars, tools: &tools, llm: &provider };

        let result = handle(&json!({"final_answer": "${x}"}), &ctx).unwrap();
        match result {
            StepOutcome::Outputs(outputs) => {
                assert_eq!(outputs.get("final_answer"), Some(&json!("hello")));
            }
            _ => panic!("expected Outputs"),
        }
    }
}
