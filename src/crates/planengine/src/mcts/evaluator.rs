//! LLM-judged verdicts used during plan optimization: whether a final
//! answer resolves the goal, what the remaining steps of a still-running
//! plan might improve, and how a batch of candidate answers ranks.
//!
//! Grounded on `original_source/app/core/plan/evaluator.py`: the same three
//! prompts (`evaulate_answer`, `reflect_step_on_final_answer`,
//! `evaluate_multiple_answers`), reusing the plan parser's JSON-object
//! extraction. `evaluate_execution_error` has no equivalent in that file (it
//! is only imported, never defined, in the optimizer module that consumes
//! it) and is modeled on `reflect_step_on_final_answer`'s shape instead.

use crate::plan::parser::extract_json_object;
use crate::plan::Plan;
use llm::LlmProvider;
use serde::Deserialize;
use serde_json::Value;

/// Verdict on whether a final answer resolves the goal, with an optional
/// note on how the plan that produced it could be improved regardless.
#[derive(Debug, Clone, Deserialize)]
pub struct AnswerVerdict {
    pub accept: bool,
    #[serde(default)]
    pub plan_adjustment_suggestion: Option<String>,
}

/// Whether the remaining (unexecuted) steps of a plan could be improved to
/// produce a better final answer, and how.
#[derive(Debug, Clone, Deserialize)]
pub struct ReflectionVerdict {
    pub should_optimize: bool,
    #[serde(default)]
    pub suggestion: String,
}

/// One candidate final answer's place in a ranked tournament.
#[derive(Debug, Clone)]
pub struct ScoredAnswer {
    pub commit_hash: String,
    pub score: f64,
    pub final_answer: Value,
}

fn answer_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Judges whether `final_answer` resolves `goal`, given the plan that
/// produced it. Returns `None` (rather than erroring) when the judge's
/// response could not be parsed, matching the original's "log and return
/// None" behavior — callers treat that as "no verdict, don't backpropagate".
pub async fn evaluate_answer(
    llm: &dyn LlmProvider,
    goal: &str,
    final_answer: &Value,
    plan: &Plan,
) -> Option<AnswerVerdict> {
    let plan_json = serde_json::to_string(plan).unwrap_or_default();
    let prompt = format!(
        "You are judging whether a Final Answer produced by a Plan fully resolves a Goal.\n\n\
         Evaluate answer quality first: does it directly and completely address the goal, \
         without irrelevant content? Then check whether the Plan's structure logically \
         supports that answer, and whether a different plan would have done better.\n\n\
         If the Answer fully resolves the Goal, accept it even if the Plan could be \
         improved; only reject when the Answer itself is incomplete or irrelevant.\n\n\
         ## Goal\n{goal}\n\n\
         ## Final Answer\n{answer}\n\n\
         ## Plan\n{plan_json}\n\n\
         Respond with a JSON object: {{\"accept\": true/false, \"plan_adjustment_suggestion\": \
         \"...\"}}.",
        answer = answer_text(final_answer),
    );

    let response = llm.generate(&prompt, None).await.ok()?;
    let object = extract_json_object(&response)?;
    serde_json::from_str(&object).ok()
}

/// Judges whether an execution error at `seq_no` suggests a change to the
/// plan's remaining steps, producing a `plan_adjustment_suggestion` in the
/// same shape as [`evaluate_answer`].
pub async fn evaluate_execution_error(
    llm: &dyn LlmProvider,
    goal: &str,
    plan: &Plan,
    error_message: &str,
    seq_no: i64,
) -> Option<AnswerVerdict> {
    let plan_json = serde_json::to_string(plan).unwrap_or_default();
    let prompt = format!(
        "A plan step failed during execution. Suggest how the plan's remaining steps \
         should change to still achieve the goal, working around this failure.\n\n\
         ## Goal\n{goal}\n\n\
         ## Plan\n{plan_json}\n\n\
         ## Failing step\n{seq_no}\n\n\
         ## Error\n{error_message}\n\n\
         Respond with a JSON object: {{\"accept\": false, \"plan_adjustment_suggestion\": \
         \"...\"}}.",
    );

    let response = llm.generate(&prompt, None).await.ok()?;
    let object = extract_json_object(&response)?;
    serde_json::from_str(&object).ok()
}

/// Judges whether the remaining steps after `current_step_no` could be
/// improved to yield a better final answer, given the answer that was
/// actually produced and any feedback already gathered from a prior
/// evaluation pass.
pub async fn reflect_step_on_final_answer(
    llm: &dyn LlmProvider,
    goal: &str,
    final_answer: &Value,
    current_step_no: i64,
    plan: &Plan,
    feedback: Option<&str>,
) -> ReflectionVerdict {
    let current_idx = current_step_no.max(0) as usize;
    let current_step = plan
        .steps
        .get(current_idx)
        .map(|s| serde_json::to_string(s).unwrap_or_default())
        .unwrap_or_default();
    let remaining = plan
        .steps
        .iter()
        .filter(|s| s.seq_no > current_step_no)
        .collect::<Vec<_>>();
    let remaining_json = serde_json::to_string(&remaining).unwrap_or_default();

    let prompt = format!(
        "Goal: {goal}\n\n\
         Final Answer: {answer}\n\n\
         Feedback: {feedback}\n\n\
         Current step ({current_step_no}):\n{current_step}\n\n\
         Remaining steps:\n{remaining_json}\n\n\
         Could the remaining steps be improved to produce a better final answer? Consider \
         adding steps that gather more relevant information, modifying existing steps for \
         more accurate data, or strengthening the reasoning that produces the answer. Focus \
         on answer quality, not execution efficiency.\n\n\
         Respond with a JSON object: {{\"should_optimize\": true/false, \"suggestion\": \
         \"...\"}}.",
        answer = answer_text(final_answer),
        feedback = feedback.unwrap_or("none"),
    );

    match llm.generate(&prompt, None).await {
        Ok(response) => match extract_json_object(&response).and_then(|o| serde_json::from_str(&o).ok()) {
            Some(verdict) => verdict,
            None => ReflectionVerdict {
                should_optimize: false,
                suggestion: format!("could not parse reflection response: {response}"),
            },
        },
        Err(err) => ReflectionVerdict {
            should_optimize: false,
            suggestion: format!("reflection request failed: {err}"),
        },
    }
}

#[derive(Deserialize)]
struct RawScore {
    commit_hash: String,
    score: f64,
}

/// Ranks candidate final answers 0-10 by how well they resolve `goal`,
/// highest first. Returns an empty vector (rather than erroring) if the
/// judge's response could not be parsed.
pub async fn evaluate_multiple_answers(
    llm: &dyn LlmProvider,
    goal: &str,
    answers: &[(String, Value)],
) -> Vec<ScoredAnswer> {
    if answers.is_empty() {
        return Vec::new();
    }

    let candidates: Vec<Value> = answers
        .iter()
        .map(|(hash, answer)| serde_json::json!({"commit_hash": hash, "answer": answer}))
        .collect();
    let prompt = format!(
        "Score each candidate answer 0-10 on how well it resolves the goal: 9-10 perfectly \
         solves it, 7-8 solves it with minor gaps, 5-6 partially solves it, 3-4 has major \
         flaws, 0-2 is irrelevant or invalid.\n\n\
         ## Goal\n{goal}\n\n\
         ## Candidates\n{candidates}\n\n\
         Respond with a JSON array: [{{\"commit_hash\": \"...\", \"score\": 0}}, ...].",
        candidates = serde_json::to_string_pretty(&candidates).unwrap_or_default(),
    );

    let Ok(response) = llm.generate(&prompt, None).await else {
        return Vec::new();
    };
    let Some(array) = crate::plan::parser::extract_json_array(&response) else {
        return Vec::new();
    };
    let Ok(scores) = serde_json::from_str::<Vec<RawScore>>(&array) else {
        return Vec::new();
    };

    let mut ranked: Vec<ScoredAnswer> = scores
        .into_iter()
        .filter_map(|s| {
            answers
                .iter()
                .find(|(hash, _)| *hash == s.commit_hash)
                .map(|(_, answer)| ScoredAnswer {
                    commit_hash: s.commit_hash.clone(),
                    score: s.score,
                    final_answer: answer.clone(),
                })
        })
        .collect();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanStep, StepType};
    use llm::MockProvider;
    use serde_json::json;

    fn plan() -> Plan {
        Plan::new(vec![
            PlanStep { seq_no: 0, step_type: StepType::Reasoning, parameters: json!({}) },
            PlanStep { seq_no: 1, step_type: StepType::Assign, parameters: json!({"final_answer": "x"}) },
        ])
    }

    #[tokio::test]
    async fn evaluate_answer_parses_accept_verdict() {
        let llm = MockProvider::with_response(r#"```json
{"accept": true, "plan_adjustment_suggestion": "none"}
```"#);
        let verdict = evaluate_answer(&llm, "goal", &json!("answer"), &plan()).await.unwrap();
        assert!(verdict.accept);
    }

    #[tokio::test]
    async fn evaluate_answer_returns_none_on_unparseable_response() {
        let llm = MockProvider::with_response("not json at all");
        assert!(evaluate_answer(&llm, "goal", &json!("answer"), &plan()).await.is_none());
    }

    #[tokio::test]
    async fn reflect_step_parses_should_optimize() {
        let llm = MockProvider::with_response(r#"{"should_optimize": true, "suggestion": "add a search step"}"#);
        let verdict = reflect_step_on_final_answer(&llm, "goal", &json!("x"), 0, &plan(), None).await;
        assert!(verdict.should_optimize);
        assert_eq!(verdict.suggestion, "add a search step");
    }

    #[tokio::test]
    async fn reflect_step_falls_back_when_unparseable() {
        let llm = MockProvider::with_response("garbage");
        let verdict = reflect_step_on_final_answer(&llm, "goal", &json!("x"), 0, &plan(), None).await;
        assert!(!verdict.should_optimize);
    }

    #[tokio::test]
    async fn evaluate_multiple_answers_ranks_by_score_descending() {
        let llm = MockProvider::with_response(
            r#"[{"commit_hash": "a", "score": 4}, {"commit_hash": "b", "score": 9}]"#,
        );
        let answers = vec![
            ("a".to_string(), json!("answer a")),
            ("b".to_string(), json!("answer b")),
        ];
        let ranked = evaluate_multiple_answers(&llm, "goal", &answers).await;
        assert_eq!(ranked[0].commit_hash, "b");
        assert_eq!(ranked[1].commit_hash, "a");
    }

    #[tokio::test]
    async fn evaluate_multiple_answers_empty_input_short_circuits() {
        let llm = MockProvider::with_response("");
        assert!(evaluate_multiple_answers(&llm, "goal", &[]).await.is_empty());
    }
}
