//! Instruction handlers: the four families spec.md §4.2 defines, plus the
//! `StepResult` sum type that replaces exception-based control flow
//! (REDESIGN FLAGS, spec.md §9).

pub mod assign;
pub mod calling;
pub mod jmp;
pub mod reasoning;

use crate::plan::{PlanStep, StepType};
use crate::tools::ToolRegistry;
use crate::vars::VariableStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a handler needs besides the step's own parameters.
pub struct HandlerContext<'a> {
    pub vars: &'a VariableStore,
    pub tools: &'a ToolRegistry,
    pub llm: &'a dyn llm::LlmProvider,
}

/// Outcome of dispatching one instruction.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Outputs to be installed into the variable store by the VM.
    Outputs(HashMap<String, Value>),
    /// An explicit jump target for the VM's program counter.
    Jump(i64),
}

/// A handler failure, carrying enough context to build a failure commit.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub error_message: String,
    pub instruction: String,
    pub params: Value,
}

pub type StepResult = Result<StepOutcome, StepFailure>;

/// Dispatch a step to its handler. Unknown instruction types fall through
/// to `calling` for backward compatibility with legacy plans (spec.md §4.2,
/// §9 Open Questions), logging a warning.
pub async fn dispatch(step: &PlanStep, ctx: &HandlerContext<'_>) -> StepResult {
    match step.step_type {
        StepType::Calling => calling::handle(&step.parameters, ctx).await,
        StepType::Jmp => jmp::handle(&step.parameters, ctx).await,
        StepType::Assign => assign::handle(&step.parameters, ctx),
        StepType::Reasoning => reasoning::handle(&step.parameters),
        StepType::Unknown => {
            tracing::warn!(
                seq_no = step.seq_no,
                "unknown instruction type, falling through to calling handler"
            );
            calling::handle(&step.parameters, ctx).await
        }
    }
}

/// Resolve a parameter value: decrement the reference count of every
/// variable it references, then interpolate it.
pub(crate) fn resolve(value: &Value, vars: &VariableStore) -> Value {
    for name in vars.find_refs(value) {
        vars.decrease_ref_count(&name);
    }
    vars.interpolate(value)
}

/// Recursively resolve every value in a JSON object.
pub(crate) fn resolve_object(
    object: &serde_json::Map<String, Value>,
    vars: &VariableStore,
) -> serde_json::Map<String, Value> {
    object
        .iter()
        .map(|(k, v)| (k.clone(), resolve(v, vars)))
        .collect()
}

/// Extract the first balanced `{...}` JSON object substring from `text`.
pub(crate) fn find_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        let c = b as char;
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
