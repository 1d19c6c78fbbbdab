//! `reasoning` handler: records a chain-of-thought trail. Always succeeds if
//! both fields are strings (spec.md §4.2).

use super::{StepFailure, StepOutcome, StepResult};
use serde_json::Value;
use std::collections::HashMap;

pub fn handle(params: &Value) -> StepResult {
    let chain_of_thoughts = params.get("chain_of_thoughts").and_then(Value::as_str);
    let dependency_analysis = params.get("dependency_analysis").and_then(Value::as_str);

    let (Some(chain), Some(deps)) = (chain_of_thoughts, dependency_analysis) else {
        return Err(StepFailure {
            error_message: "reasoning step requires string chain_of_thoughts and dependency_analysis".into(),
            instruction: "reasoning".into(),
            params: params.clone(),
        });
    };

    let mut outputs = HashMap::new();
    outputs.insert(
        "__reasoning_msg".to_string(),
        Value::String(format!("{chain}\n{deps}")),
    );
    Ok(StepOutcome::Outputs(outputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn succeeds_with_both_fields() {
        let result = handle(&json!({"chain_of_thoughts": "a", "dependency_analysis": "b"}));
        assert!(matches!(result, Ok(StepOutcome::Outputs(_))));
    }

    #[test]
    fn fails_without_required_fields() {
        let result = handle(&json!({"chain_of_thoughts": "a"}));
        assert!(result.is_err());
    }
}
