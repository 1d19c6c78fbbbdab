//! Tool registry: name -> callable, with docstrings and parameter
//! introspection so `calling` steps never forward unexpected keys.
//!
//! Grounded on spec.md §4.3 and the "Runtime reflection / named-keyword
//! dispatch" design note (§9): tools are explicit descriptor records rather
//! than reflected-over language callables.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One parameter a tool accepts.
#[derive(Debug, Clone)]
pub struct ToolParam {
    pub name: String,
    pub required: bool,
    pub type_hint: String,
}

/// A named, described, invocable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Human-readable description; first line is used as the catalog
    /// summary. Must be non-empty (enforced at registration).
    fn description(&self) -> &str;

    /// Declared parameter set, used to filter incoming arguments so the
    /// tool only ever receives keys it declares.
    fn params(&self) -> &[ToolParam];

    async fn call(&self, args: HashMap<String, Value>) -> anyhow::Result<Value>;
}

/// Process-wide (here: per-engine-instance) registry of tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("tool '{0}' has an empty description")]
    EmptyDescription(String),
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Requires a non-empty description.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistrationError> {
        if tool.description().trim().is_empty() {
            return Err(RegistrationError::EmptyDescription(tool.name().to_string()));
        }
        self.tools.insert(tool.name().to_string(), tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Filter `args` down to keys the tool declares, dropping anything
    /// unexpected.
    pub fn filter_args(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
    ) -> HashMap<String, Value> {
        let Some(tool) = self.get(tool_name) else {
            return HashMap::new();
        };
        let allowed: std::collections::HashSet<&str> =
            tool.params().iter().map(|p| p.name.as_str()).collect();
        args.into_iter()
            .filter(|(k, _)| allowed.contains(k.as_str()))
            .collect()
    }

    /// Human-readable catalog, optionally filtered to an allow-list of
    /// tool names (namespaces restrict which tools a task may use).
    pub fn describe(&self, allowed: Option<&[String]>) -> String {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            if let Some(allow) = allowed {
                if !allow.iter().any(|a| a == name) {
                    continue;
                }
            }
            let tool = &self.tools[name];
            let summary = tool.description().lines().next().unwrap_or("");
            out.push_str(&format!("- {name}: {summary}\n"));
            for param in tool.params() {
                let req = if param.required { "required" } else { "optional" };
                out.push_str(&format!(
                    "    - {} ({}, {})\n",
                    param.name, param.type_hint, req
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes its input.\nTakes `msg` and returns it unchanged."
        }
        fn params(&self) -> &[ToolParam] {
            static PARAMS: std::sync::OnceLock<Vec<ToolParam>> = std::sync::OnceLock::new();
            PARAMS.get_or_init(|| {
                vec![ToolParam {
                    name: "msg".to_string(),
                    required: true,
                    type_hint: "string".to_string(),
                }]
            })
        }
        async fn call(&self, args: HashMap<String, Value>) -> anyhow::Result<Value> {
            Ok(args.get("msg").cloned().unwrap_or(Value::Null))
        }
    }

    #[test]
    fn describe_filters_by_allowlist() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        assert!(registry.describe(None).contains("echo"));
        assert!(registry
            .describe(Some(&["other".to_string()]))
            .is_empty());
    }

    #[test]
    fn filter_args_drops_unexpected_keys() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let mut args = HashMap::new();
        args.insert("msg".to_string(), Value::String("hi".into()));
        args.insert("extra".to_string(), Value::Bool(true));
        let filtered = registry.filter_args("echo", args);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("msg"));
    }

    #[tokio::test]
    async fn unknown_tool_lookup_returns_none() {
        let registry = ToolRegistry::new();
        assert!(registry.get("missing").is_none());
    }
}
