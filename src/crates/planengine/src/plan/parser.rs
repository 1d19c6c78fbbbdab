//! Plan parser: extracts `<think>` reasoning and a fenced/bare JSON plan
//! array from raw LLM output.
//!
//! Grounded on spec.md §4.6 and `original_source/app/core/plan/utils.py`.

use super::{Plan, PlanStep};
use regex::Regex;

/// Reasoning text plus the parsed plan.
#[derive(Debug, Clone)]
pub struct ParsedPlan {
    pub reasoning: String,
    pub plan: Plan,
}

/// Plan text could not be parsed out of the LLM's raw response.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("no JSON array found in response")]
    NoArrayFound,
    #[error("invalid plan JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Parse `<think>...</think><answer>```json [ ... ] ```</answer>` (or a bare
/// response with no `<answer>` tag, in which case the whole body is treated
/// as the plan).
pub fn parse(raw: &str) -> Result<ParsedPlan, ParseError> {
    let reasoning = extract_tag(raw, "think").unwrap_or_default();
    let body = extract_tag(raw, "answer").unwrap_or_else(|| raw.to_string());

    let array_text = extract_json_array(&body).ok_or(ParseError::NoArrayFound)?;
    let steps = parse_steps(&array_text)?;

    Ok(ParsedPlan {
        reasoning: reasoning.trim().to_string(),
        plan: Plan::new(steps),
    })
}

fn parse_steps(array_text: &str) -> Result<Vec<PlanStep>, ParseError> {
    match serde_json::from_str::<Vec<PlanStep>>(array_text) {
        Ok(steps) => Ok(steps),
        Err(first_err) => {
            // Retry once with unicode escapes unescaped, matching the
            // original's fallback for LLM output that double-escapes `\uXXXX`.
            let unescaped = unescape_unicode(array_text);
            serde_json::from_str::<Vec<PlanStep>>(&unescaped).map_err(|_| first_err.into())
        }
    }
}

fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"(?s)<{tag}>(.*?)</{tag}>");
    let re = Regex::new(&pattern).ok()?;
    re.captures(text).map(|c| c[1].to_string())
}

/// Locate the first balanced `[...]` JSON array in `text`, preferring the
/// contents of a ```json fenced block if one is present.
pub(crate) fn extract_json_array(text: &str) -> Option<String> {
    if let Some(fenced) = extract_fenced_block(text) {
        if let Some(array) = find_balanced_array(&fenced) {
            return Some(array);
        }
    }
    find_balanced_array(text)
}

/// Locate the first balanced `{...}` JSON object in `text`, preferring the
/// contents of a ```json fenced block if one is present. Shared by callers
/// outside the plan parser (e.g. the MCTS evaluator's LLM-judged verdicts).
pub(crate) fn extract_json_object(text: &str) -> Option<String> {
    if let Some(fenced) = extract_fenced_block(text) {
        if let Some(object) = find_balanced_object(&fenced) {
            return Some(object);
        }
    }
    find_balanced_object(text)
}

fn find_balanced_object(text: &str) -> Option<String> {
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
                    return Some(text[start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_fenced_block(text: &str) -> Option<String> {
    let re = Regex::new(r"(?s)```(?:json)?\s*(.*?)```").ok()?;
    re.captures(text).map(|c| c[1].to_string())
}

fn find_balanced_array(text: &str) -> Option<String> {
    let start = text.find('[')?;
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
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Collapse double-escaped unicode sequences (`\\uXXXX` -> `\uXXXX`) that
/// some providers emit when a JSON string is serialized twice.
fn unescape_unicode(text: &str) -> String {
    text.replace("\\\\u", "\\u")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::StepType;

    #[test]
    fn parses_think_and_answer_sections() {
        let raw = r#"<think>because X</think><answer>```json
[{"seq_no": 0, "type": "reasoning", "parameters": {"chain_of_thoughts": "a", "dependency_analysis": "b"}}]
```</answer>"#;
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.reasoning, "because X");
        assert_eq!(parsed.plan.len(), 1);
        assert_eq!(parsed.plan.steps[0].step_type, StepType::Reasoning);
    }

    #[test]
    fn falls_back_to_whole_body_without_answer_tag() {
        let raw = r#"[{"seq_no": 0, "type": "assign", "parameters": {"final_answer": "x"}}]"#;
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.plan.len(), 1);
    }

    #[test]
    fn errors_without_any_array() {
        let raw = "no plan here";
        assert!(matches!(parse(raw), Err(ParseError::NoArrayFound)));
    }

    #[test]
    fn ignores_trailing_text_after_balanced_array() {
        let raw = r#"<answer>[{"seq_no": 0, "type": "reasoning", "parameters": {}}] -- done</answer>"#;
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.plan.len(), 1);
    }

    #[test]
    fn unknown_step_type_falls_through_to_unknown() {
        let raw = r#"[{"seq_no": 0, "type": "legacy_noop", "parameters": {}}]"#;
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.plan.steps[0].step_type, StepType::Unknown);
    }

    #[test]
    fn extract_json_object_prefers_fenced_block_over_surrounding_text() {
        let raw = "Here is my answer:\n```json\n{\"accept\": true, \"score\": 9}\n```\nThanks.";
        let object = extract_json_object(raw).unwrap();
        assert_eq!(object, "{\"accept\": true, \"score\": 9}");
    }

    #[test]
    fn extract_json_object_handles_nested_braces() {
        let raw = r#"{"a": {"b": 1}, "c": 2}"#;
        assert_eq!(extract_json_object(raw).unwrap(), raw);
    }
}
