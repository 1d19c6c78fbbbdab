//! Plan cache: an immutable snapshot of `(goal → best plan)` refreshed from
//! storage on a timer (spec.md §4.8).
//!
//! Grounded on `original_source/app/controller/simple_cache.py`: goals are
//! normalized (trim, strip trailing punctuation, lowercase), matched by
//! string similarity above a fixed cutoff, and a response-format language
//! match decides whether the hit counts as reusable (`matched: true`) or
//! merely a reference for few-shot (`matched: false`).

use crate::db::DatabasePool;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Duration, Instant};

const SIMILARITY_CUTOFF: f64 = 0.95;
const WARM_UP: Duration = Duration::from_secs(10);
const REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// One goal's cached plan, keyed in the snapshot by its normalized form.
#[derive(Debug, Clone)]
pub struct CachedPlan {
    pub goal: String,
    pub response_format: Option<Value>,
    pub best_plan: Value,
}

/// Result of a cache lookup: either a directly reusable plan (`matched`)
/// or a merely-similar reference plan for few-shot prompting.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub matched: bool,
    pub plan: CachedPlan,
}

#[derive(Default)]
struct Snapshot {
    entries: HashMap<String, CachedPlan>,
    normalized_goals: Vec<String>,
}

/// Normalizes a goal for cache keying: trim, strip trailing `.,!?`, lowercase.
pub fn normalize_goal(goal: &str) -> String {
    let trimmed = goal.trim();
    let trimmed = trimmed.trim_end_matches(|c| matches!(c, '.' | ',' | '!' | '?'));
    trimmed.to_lowercase()
}

/// Ratcliff/Obershelp-style similarity ratio in `[0.0, 1.0]`, matching
/// `difflib.SequenceMatcher.ratio()`'s definition closely enough for the
/// cutoff comparison this cache relies on.
fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let matches = matching_chars(&a, &b);
    (2 * matches) as f64 / (a.len() + b.len()) as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let (ai, bj, size) = longest_common_substring(a, b);
    if size == 0 {
        return 0;
    }
    matching_chars(&a[..ai], &b[..bj]) + size + matching_chars(&a[ai + size..], &b[bj + size..])
}

fn longest_common_substring(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut dp = vec![0usize; b.len() + 1];
    let mut best = (0, 0, 0);
    for i in 0..a.len() {
        let mut prev_diag = 0;
        for j in 0..b.len() {
            let current = dp[j + 1];
            dp[j + 1] = if a[i] == b[j] { prev_diag + 1 } else { 0 };
            if dp[j + 1] > best.2 {
                best = (i + 1 - dp[j + 1], j + 1 - dp[j + 1], dp[j + 1]);
            }
            prev_diag = current;
        }
    }
    best
}

fn response_format_lang(response_format: Option<&Value>) -> Option<String> {
    let rf = response_format?;
    rf.get("Lang")
        .or_else(|| rf.get("lang"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Process-wide plan cache. Readers see a consistent snapshot with no
/// locking cost beyond the `RwLock` read guard; writers (refresh) swap the
/// whole snapshot under the same lock.
pub struct PlanCache {
    db: DatabasePool,
    snapshot: RwLock<Snapshot>,
}

impl PlanCache {
    pub fn new(db: DatabasePool) -> Self {
        Self { db, snapshot: RwLock::new(Snapshot::default()) }
    }

    /// Reloads the snapshot from persisted tasks with a saved `best_plan`.
    pub async fn refresh(&self) -> crate::error::Result<()> {
        use sqlx::Row;

        let rows = sqlx::query("SELECT goal, best_plan, meta FROM tasks WHERE best_plan IS NOT NULL")
            .fetch_all(self.db.raw())
            .await
            .map_err(crate::commit_graph::CommitGraphError::from)?;

        let mut entries = HashMap::new();
        let mut normalized_goals = Vec::new();
        for row in rows {
            let goal: String = row.get("goal");
            let best_plan: Option<String> = row.get("best_plan");
            let meta: Option<String> = row.get("meta");
            let Some(best_plan) = best_plan.and_then(|s| serde_json::from_str::<Value>(&s).ok())
            else {
                continue;
            };
            let normalized = normalize_goal(&goal);
            if entries.contains_key(&normalized) {
                continue;
            }
            let response_format = meta
                .and_then(|s| serde_json::from_str::<Value>(&s).ok())
                .and_then(|v| v.get("response_format").cloned());
            entries.insert(normalized.clone(), CachedPlan { goal, response_format, best_plan });
            normalized_goals.push(normalized);
        }

        let mut snapshot = self.snapshot.write().await;
        snapshot.entries = entries;
        snapshot.normalized_goals = normalized_goals;
        Ok(())
    }

    /// Finds the closest cached goal above the similarity cutoff. If its
    /// response-format language matches `response_format`'s, the hit is
    /// directly reusable (`matched: true`); otherwise the closest match is
    /// still returned as a reference for few-shot prompting.
    pub async fn get(&self, goal: &str, response_format: Option<&Value>) -> Option<CacheHit> {
        let normalized = normalize_goal(goal);
        let snapshot = self.snapshot.read().await;

        let mut ranked: Vec<(&String, f64)> = snapshot
            .normalized_goals
            .iter()
            .map(|g| (g, similarity_ratio(&normalized, g)))
            .filter(|(_, score)| *score >= SIMILARITY_CUTOFF)
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        if ranked.is_empty() {
            return None;
        }

        let goal_lang = response_format_lang(response_format);
        for (key, _) in &ranked {
            let candidate = &snapshot.entries[*key];
            let candidate_lang = response_format_lang(candidate.response_format.as_ref());
            if let (Some(a), Some(b)) = (&goal_lang, &candidate_lang) {
                if a == b {
                    return Some(CacheHit { matched: true, plan: candidate.clone() });
                }
            }
        }

        let top_key = ranked[0].0;
        Some(CacheHit { matched: false, plan: snapshot.entries[top_key].clone() })
    }
}

/// Spawns the 24-hour refresh loop with a 10-second warm-up, matching the
/// original background scheduler's cadence.
pub fn spawn_refresh_loop(cache: Arc<PlanCache>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + WARM_UP, REFRESH_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = cache.refresh().await {
                tracing::error!(error = %err, "plan cache refresh failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(normalize_goal("  Summarise X!  "), "summarise x");
        assert_eq!(normalize_goal("Do THIS now..."), "do this now");
    }

    #[test]
    fn identical_strings_are_fully_similar() {
        assert_eq!(similarity_ratio("configure replication", "configure replication"), 1.0);
    }

    #[test]
    fn near_identical_strings_exceed_cutoff() {
        let ratio = similarity_ratio("configure replications", "configure replication");
        assert!(ratio >= SIMILARITY_CUTOFF, "ratio was {ratio}");
    }

    #[test]
    fn dissimilar_strings_fall_below_cutoff() {
        let ratio = similarity_ratio("configure replication", "deploy a web server");
        assert!(ratio < SIMILARITY_CUTOFF, "ratio was {ratio}");
    }

    async fn seeded_cache() -> PlanCache {
        let db = DatabasePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "INSERT INTO tasks (id, goal, status, best_plan, meta, created_at, updated_at) VALUES (?, ?, 'completed', ?, ?, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
        )
        .bind("t1")
        .bind("Configure replication")
        .bind(r#"{"steps": []}"#)
        .bind(r#"{"response_format": {"Lang": "en"}}"#)
        .execute(db.raw())
        .await
        .unwrap();

        let cache = PlanCache::new(db);
        cache.refresh().await.unwrap();
        cache
    }

    #[tokio::test]
    async fn matching_language_returns_a_reusable_hit() {
        let cache = seeded_cache().await;
        let hit = cache
            .get("Configure replication", Some(&json!({"Lang": "en"})))
            .await
            .unwrap();
        assert!(hit.matched);
        assert_eq!(hit.plan.goal, "Configure replication");
    }

    #[tokio::test]
    async fn mismatched_language_returns_a_reference_only() {
        let cache = seeded_cache().await;
        let hit = cache
            .get("Configure replication", Some(&json!({"Lang": "fr"})))
            .await
            .unwrap();
        assert!(!hit.matched);
    }

    #[tokio::test]
    async fn unrelated_goal_has_no_hit() {
        let cache = seeded_cache().await;
        let hit = cache.get("deploy a web server", None).await;
        assert!(hit.is_none());
    }
}
