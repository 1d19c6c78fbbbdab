//! `calling` handler: resolves tool parameters, invokes the named tool, and
//! extracts its declared outputs (spec.md §4.2).

use super::{find_balanced_object, resolve, HandlerContext, StepFailure, StepOutcome, StepResult};
use serde_json::Value;
use std::collections::HashMap;

pub async fn handle(params: &Value, ctx: &HandlerContext<'_>) -> StepResult {
    let fail = |message: String| StepFailure {
        error_message: message,
        instruction: "calling".into(),
        params: params.clone(),
    };

    let tool_name = params
        .get("tool_name")
        .and_then(Value::as_str)
        .ok_or_else(|| fail("calling step missing tool_name".into()))?;

    let output_vars: Vec<String> = match params.get("output_vars") {
        Some(Value::Array(items)) => {
            let mut names = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(name) => names.push(name.to_string()),
                    None => return Err(fail("output_vars must be a list of strings".into())),
                }
            }
            names
        }
        _ => return Err(fail("calling step missing a list output_vars".into())),
    };

    let tool = ctx
        .tools
        .get(tool_name)
        .ok_or_else(|| fail(format!("unknown tool: {tool_name}")))?;

    let raw_params = params
        .get("tool_params")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let mut resolved_args: HashMap<String, Value> = raw_params
        .iter()
        .map(|(k, v)| (k.clone(), resolve(v, ctx.vars)))
        .collect();

    // When more than one output is requested, hint the tool towards
    // structured output by attaching a fill-in-the-blanks example.
    if output_vars.len() > 1 {
        let example: serde_json::Map<String, Value> = output_vars
            .iter()
            .map(|name| (name.clone(), Value::String("<to be filled>".into())))
            .collect();
        resolved_args.insert("response_format".to_string(), Value::Object(example));
    }

    let filtered_args = ctx.tools.filter_args(tool_name, resolved_args);

    let raw_result = tool
        .call(filtered_args)
        .await
        .map_err(|e| fail(format!("tool '{tool_name}' failed: {e}")))?;

    extract_outputs(&raw_result, &output_vars)
        .map(StepOutcome::Outputs)
        .ok_or_else(|| fail(format!("tool '{tool_name}' result did not satisfy {output_vars:?}")))
}

/// Parse a tool's return value into the requested output map.
///
/// If the result is a string, try to extract the first balanced JSON
/// object; if it contains every requested key, use those values. Otherwise,
/// for a single requested output, the whole return value becomes that
/// output.
fn extract_outputs(raw: &Value, output_vars: &[String]) -> Option<HashMap<String, Value>> {
    if let Value::String(s) = raw {
        if let Some(object_text) = find_balanced_object(s) {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(object_text) {
                if output_vars.iter().all(|name| map.contains_key(name)) {
                    return Some(
                        output_vars
                            .iter()
                            .map(|name| (name.clone(), map[name].clone()))
                            .collect(),
                    );
                }
            }
        }
    } else if let Value::Object(map) = raw {
        if output_vars.iter().all(|name| map.contains_key(name)) {
            return Some(
                output_vars
                    .iter()
                    .map(|name| (name.clone(), map[name].clone()))
                    .collect(),
            );
        }
    }

    if output_vars.len() == 1 {
        let mut out = HashMap::new();
        out.insert(output_vars[0].clone(), raw.clone());
        return Some(out);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Tool, ToolParam, ToolRegistry};
    use crate::vars::VariableStore;
    use async_trait::async_trait;
    use llm::MockProvider;
    use serde_json::json;
    use std::sync::Arc;

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
            PARAMS.get_or_init(|| {
                vec![ToolParam { name: "msg".into(), required: true, type_hint: "string".into() }]
            })
        }
        async fn call(&self, args: HashMap<String, Value>) -> anyhow::Result<Value> {
            Ok(args.get("msg").cloned().unwrap_or(Value::Null))
        }
    }

    fn ctx<'a>(vars: &'a VariableStore, tools: &'a ToolRegistry, llm: &'a MockProvider) -> HandlerContext<'a> {
        HandlerContext { vars, tools, llm }
    }

    #[tokio::test]
    async fn single_output_uses_whole_result() {
        let vars = VariableStore::new();
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(Echo)).unwrap();
        let provider = MockProvider::with_response("");
        let c = ctx(&vars, &tools, &provider);

        let result = handle(
            &json!({"tool_name": "tool_echo", "tool_params": {"msg": "hello"}, "output_vars": ["x"]}),
            &c,
        )
        .await
        .unwrap();

        match result {
            StepOutcome::Outputs(out) => assert_eq!(out.get("x"), Some(&json!("hello"))),
            _ => panic!("expected Outputs"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_fails() {
        let vars = VariableStore::new();
        let tools = ToolRegistry::new();
        let provider = MockProvider::with_response("");
        let c = ctx(&vars, &tools, &provider);

        let result = handle(
            &json!({"tool_name": "nonexistent", "tool_params": {}, "output_vars": ["x"]}),
            &c,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_output_vars_fails() {
        let vars = VariableStore::new();
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(Echo)).unwrap();
        let provider = MockProvider::with_response("");
        let c = ctx(&vars, &tools, &provider);

        let result = handle(&json!({"tool_name": "tool_echo", "tool_params": {}}), &c).await;
        assert!(result.is_err());
    }

    #[test]
    fn extract_outputs_parses_embedded_json_object() {
        let raw = json!("here you go: {\"a\": 1, \"b\": 2} thanks");
        let out = extract_outputs(&raw, &["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(out.get("a"), Some(&json!(1)));
        assert_eq!(out.get("b"), Some(&json!(2)));
    }

    #[test]
    fn extract_outputs_falls_back_to_whole_value_for_single_output() {
        let raw = json!("plain text");
        let out = extract_outputs(&raw, &["x".to_string()]).unwrap();
        assert_eq!(out.get("x"), Some(&json!("plain text")));
    }

    #[test]
    fn extract_outputs_fails_multi_output_without_match() {
        let raw = json!("plain text");
        assert!(extract_outputs(&raw, &["a".to_string(), "b".to_string()]).is_none());
    }
}
