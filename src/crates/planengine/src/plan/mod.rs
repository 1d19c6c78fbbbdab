//! Plan data model: the typed instruction sequence the VM executes.
//!
//! Grounded on spec.md §3 ("Plan step") and §4.6, with field shapes taken
//! from `original_source/app/core/plan/utils.py` and
//! `app/tools/instruction_handlers.py`.

pub mod generator;
pub mod optimizer;
pub mod parser;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One element of a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub seq_no: i64,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub parameters: Value,
}

/// The four instruction families spec.md §4.2 defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Calling,
    Jmp,
    Assign,
    Reasoning,
    /// Anything else. Spec.md §9 Open Questions: legacy plans may carry an
    /// unknown instruction type; it is dispatched as `calling` for backward
    /// compatibility, with a logged warning.
    #[serde(other)]
    Unknown,
}

/// An ordered, validated plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Find the index of the step whose `seq_no` equals `seq`. `seq_no`s are
    /// unique within a plan (spec.md §8).
    pub fn find_step_index(&self, seq: i64) -> Option<usize> {
        self.steps.iter().position(|s| s.seq_no == seq)
    }

    pub fn step_at(&self, index: usize) -> Option<&PlanStep> {
        self.steps.get(index)
    }

    /// Producing `seq_no`s for each requested variable name: for each name,
    /// the steps whose declared `output_vars` (calling) or assign keys
    /// include it.
    pub fn parse_dependencies(&self, names: &[String]) -> HashMap<String, Vec<i64>> {
        let mut out: HashMap<String, Vec<i64>> = names.iter().map(|n| (n.clone(), Vec::new())).collect();
        for step in &self.steps {
            match step.step_type {
                StepType::Calling => {
                    if let Some(outputs) = step
                        .parameters
                        .get("output_vars")
                        .and_then(|v| v.as_array())
                    {
                        for output in outputs {
                            if let Some(name) = output.as_str() {
                                if let Some(entry) = out.get_mut(name) {
                                    entry.push(step.seq_no);
                                }
                            }
                        }
                    }
                }
                StepType::Assign => {
                    if let Some(map) = step.parameters.as_object() {
                        for key in map.keys() {
                            if let Some(entry) = out.get_mut(key) {
                                entry.push(step.seq_no);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Reverse-scan for the plan's final-answer producer: either an
    /// `assign` targeting `final_answer`, or a `calling` step whose
    /// `output_vars` include it. Returns `None` if no such step exists.
    pub fn parse_final_answer(&self) -> Option<&PlanStep> {
        self.steps.iter().rev().find(|step| match step.step_type {
            StepType::Assign => step
                .parameters
                .as_object()
                .map(|m| m.contains_key("final_answer"))
                .unwrap_or(false),
            StepType::Calling => step
                .parameters
                .get("output_vars")
                .and_then(|v| v.as_array())
                .map(|vars| vars.iter().any(|v| v.as_str() == Some("final_answer")))
                .unwrap_or(false),
            _ => false,
        })
    }

    /// Count, per-variable, how many times `${name}` appears across steps
    /// from `from_seq` (inclusive) forward. Used by
    /// `PlanVm::recalculate_variable_refs`.
    pub fn count_refs_from(&self, from_seq_index: usize) -> HashMap<String, i64> {
        let mut counts: HashMap<String, i64> = HashMap::new();
        for step in self.steps.iter().skip(from_seq_index) {
            count_refs_in_value(&step.parameters, &mut counts);
        }
        counts
    }
}

fn count_refs_in_value(value: &Value, counts: &mut HashMap<String, i64>) {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let pattern = PATTERN.get_or_init(|| regex::Regex::new(r"\$\{(\w+)(?:\.\w+)?\}").unwrap());
    match value {
        Value::String(s) => {
            for caps in pattern.captures_iter(s) {
                *counts.entry(caps[1].to_string()).or_insert(0) += 1;
            }
        }
        Value::Array(items) => {
            for item in items {
                count_refs_in_value(item, counts);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                count_refs_in_value(v, counts);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(seq_no: i64, step_type: StepType, parameters: Value) -> PlanStep {
        PlanStep { seq_no, step_type, parameters }
    }

    #[test]
    fn find_step_index_locates_unique_seq() {
        let plan = Plan::new(vec![
            step(0, StepType::Reasoning, json!({})),
            step(5, StepType::Assign, json!({"x": "1"})),
        ]);
        assert_eq!(plan.find_step_index(5), Some(1));
        assert_eq!(plan.find_step_index(99), None);
    }

    #[test]
    fn parse_final_answer_finds_assign() {
        let plan = Plan::new(vec![
            step(0, StepType::Assign, json!({"final_answer": "a"})),
            step(1, StepType::Assign, json!({"other": "b"})),
        ]);
        let found = plan.parse_final_answer().unwrap();
        assert_eq!(found.seq_no, 0);
    }

    #[test]
    fn parse_final_answer_finds_calling_output() {
        let plan = Plan::new(vec![step(
            0,
            StepType::Calling,
            json!({"tool_name": "t", "tool_params": {}, "output_vars": ["final_answer"]}),
        )]);
        assert!(plan.parse_final_answer().is_some());
    }

    #[test]
    fn parse_final_answer_absent_is_none() {
        let plan = Plan::new(vec![step(0, StepType::Reasoning, json!({}))]);
        assert!(plan.parse_final_answer().is_none());
    }
}
