//! Splits a trailing `(key: value, ...)` requirements block off a raw goal
//! string, matching spec.md §6 "Goal syntax".
//!
//! Grounded on `original_source/app/core/task/utils.py`'s
//! `parse_goal_response_format`/`_parse_response_format`: the *last*
//! balanced parenthesized suffix (found by scanning backward from the final
//! `)`) is treated as a comma-separated `key: value` block, not whatever the
//! first `(...)` in the goal happens to be.
use serde_json::{Map, Value};

/// Strips a surrounding pair of double quotes, then the goal's trailing
/// balanced-parenthesis suffix if one is present, parsing it into a
/// `response_format` map keyed by whatever labels it names (`Lang`,
/// `Format`, or anything else the caller wrote).
pub fn parse_goal_response_format(goal: &str) -> (String, Option<Value>) {
    let mut clean = goal.trim();
    if let Some(rest) = clean.strip_prefix('"') {
        clean = rest.trim_start();
    }
    if let Some(rest) = clean.strip_suffix('"') {
        clean = rest.trim_end();
    }

    let (clean_goal, requirements) = extract_last_parentheses(clean);
    if requirements.is_empty() {
        return (clean_goal, None);
    }
    (clean_goal, Some(parse_response_format(&requirements)))
}

/// Scans backward from the final `)` for its matching `(`, returning the
/// goal with that suffix removed and the suffix's inner text. Returns the
/// whole string unchanged (with an empty suffix) if no balanced pair exists.
fn extract_last_parentheses(s: &str) -> (String, String) {
    let chars: Vec<char> = s.chars().collect();
    let Some(last_close) = chars.iter().rposition(|&c| c == ')') else {
        return (s.to_string(), String::new());
    };

    let mut depth = 0i32;
    for i in (0..=last_close).rev() {
        match chars[i] {
            ')' => depth += 1,
            '(' => {
                depth -= 1;
                if depth == 0 {
                    let before: String = chars[..i].iter().collect();
                    let inner: String = chars[i + 1..last_close].iter().collect();
                    return (before.trim().to_string(), inner.trim().to_string());
                }
            }
            _ => {}
        }
    }
    (s.to_string(), String::new())
}

fn parse_response_format(requirements: &str) -> Value {
    let mut map = Map::new();
    for part in split_requirement_parts(requirements) {
        match part.split_once(':') {
            Some((key, value)) => {
                map.insert(key.trim().to_string(), Value::String(value.trim().to_string()));
            }
            None => {
                map.insert(part.trim().to_string(), Value::Null);
            }
        }
    }
    Value::Object(map)
}

/// Splits on commas that precede a `word: value` pair, so a comma inside a
/// value (e.g. `Format: markdown, with tables`) does not start a new key.
fn split_requirement_parts(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ',' && starts_new_key(&chars[i + 1..]) {
            parts.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(chars[i]);
        }
        i += 1;
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Whether `rest` (the text just after a comma) looks like the start of a
/// new `word: value` pair rather than a continuation of the current value.
fn starts_new_key(rest: &[char]) -> bool {
    let trimmed: String = rest.iter().collect::<String>().trim_start().to_string();
    let key_part: String = trimmed.chars().take_while(|c| *c != ':' && *c != ',' && *c != '(' && *c != ')').collect();
    if key_part.is_empty() || key_part.len() == trimmed.len() {
        return false;
    }
    key_part.chars().all(|c| c.is_alphanumeric() || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_requirements_block() {
        let (goal, format) = parse_goal_response_format("Summarize the report (Lang: en, Format: markdown)");
        assert_eq!(goal, "Summarize the report");
        let format = format.unwrap();
        assert_eq!(format["Lang"], "en");
        assert_eq!(format["Format"], "markdown");
    }

    #[test]
    fn goal_without_parentheses_is_unchanged() {
        let (goal, format) = parse_goal_response_format("Summarize the report");
        assert_eq!(goal, "Summarize the report");
        assert!(format.is_none());
    }

    #[test]
    fn uses_the_last_balanced_parenthesis_not_the_first() {
        let (goal, format) = parse_goal_response_format("Describe (in detail) the rollout (Lang: en)");
        assert_eq!(goal, "Describe (in detail) the rollout");
        assert_eq!(format.unwrap()["Lang"], "en");
    }

    #[test]
    fn strips_surrounding_quotes() {
        let (goal, _) = parse_goal_response_format("\"Summarize the report\"");
        assert_eq!(goal, "Summarize the report");
    }

    #[test]
    fn key_without_value_maps_to_null() {
        let (_, format) = parse_goal_response_format("Goal (urgent)");
        assert!(format.unwrap()["urgent"].is_null());
    }
}
