//! Monte Carlo Tree Search plan optimizer (spec.md §4.12).
//!
//! Grounded on `original_source/plan_optimization/plan_mcts_optimizer.py`:
//! a task's full commit history, across every branch it has ever grown, is
//! loaded into a tree (`_build_mcts_tree`); each round walks that tree with
//! UCB1 selection down to a leaf (`select_node`), extends the leaf by
//! continuing or revising its branch (`expand_node`), judges any newly
//! reached final answer with an LLM (`evaluate_state`), and propagates that
//! score back up the path that was walked (`backpropagate`). A finished
//! run ranks every final answer the tree contains and saves the best one.
//!
//! The tree is arena-indexed (`Vec<TreeNode>` with index-based parent and
//! child links) rather than built from `Rc<RefCell<_>>` nodes: the whole
//! tree is known up front from existing commits, so there is no need for
//! shared mutable ownership, and plain indices keep the borrow checker out
//! of the way while nodes are pushed and linked.

pub mod evaluator;

use crate::commit_graph::Commit;
use crate::error::{PlanEngineError, Result};
use crate::task::Task;
use crate::vm::VmState;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_EXPLORATION_WEIGHT: f64 = std::f64::consts::SQRT_2;
const DEFAULT_MAX_ITERATIONS: usize = 20;
const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(300);

/// One position in the search tree: a commit, the `VmState` it snapshots,
/// and this node's accumulated search statistics.
#[derive(Debug, Clone)]
struct TreeNode {
    commit_hash: String,
    parent: Option<usize>,
    children: Vec<usize>,
    visits: u32,
    value: f64,
    final_answer: Option<Value>,
    state: VmState,
}

impl TreeNode {
    /// UCB1: exploitation (average score) plus an exploration bonus that
    /// shrinks as this node accumulates visits. Unvisited nodes are always
    /// selected first.
    fn ucb_score(&self, parent_visits: u32, exploration_weight: f64) -> f64 {
        if self.visits == 0 {
            return f64::INFINITY;
        }
        let exploitation = self.value / self.visits as f64;
        let exploration =
            exploration_weight * ((parent_visits.max(1) as f64).ln() / self.visits as f64).sqrt();
        exploitation + exploration
    }
}

/// Tuning knobs for one [`PlanOptimizer::optimize`] run.
#[derive(Debug, Clone)]
pub struct OptimizerOptions {
    pub max_iterations: usize,
    pub time_limit: Duration,
    pub exploration_weight: f64,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            time_limit: DEFAULT_TIME_LIMIT,
            exploration_weight: DEFAULT_EXPLORATION_WEIGHT,
        }
    }
}

/// One candidate final answer surfaced by a completed optimization run,
/// ranked by the judge's score (spec.md §4.12 `sort_final_answers`).
#[derive(Debug, Clone)]
pub struct RankedAnswer {
    pub commit_hash: String,
    pub score: f64,
    pub final_answer: Value,
}

/// Builds and searches the tree of commits a task has produced across all
/// of its branches, looking for the best-scoring final answer.
pub struct PlanOptimizer {
    task: Arc<Task>,
    nodes: Vec<TreeNode>,
    root: usize,
}

impl PlanOptimizer {
    /// Loads every commit the task has ever written and arranges it into a
    /// tree by `parent_hash`. Errors if the task has no commits at all.
    pub async fn load(task: Arc<Task>) -> Result<Self> {
        let commits = task.get_all_commits().await?;
        let (nodes, root) = build_tree(commits)?;
        Ok(Self { task, nodes, root })
    }

    /// Runs up to `options.max_iterations` rounds of select/expand/evaluate
    /// /backpropagate, stopping early once `options.time_limit` elapses,
    /// then ranks every final answer the tree now contains.
    pub async fn optimize(&mut self, options: OptimizerOptions) -> Result<Vec<RankedAnswer>> {
        let start = Instant::now();
        for _ in 0..options.max_iterations {
            if start.elapsed() >= options.time_limit {
                break;
            }

            let leaf = self.select_node(options.exploration_weight);

            // A leaf that already carries a judged final answer gets
            // re-scored and backpropagated in place; it has nothing left to
            // expand into.
            if self.nodes[leaf].final_answer.is_some() {
                if let Some(score) = self.evaluate_state(leaf).await {
                    self.backpropagate(leaf, score);
                } else {
                    self.backpropagate(leaf, 0.0);
                }
                continue;
            }

            match self.expand_node(leaf).await? {
                Some(new_node) => {
                    let score = self.evaluate_state(new_node).await.unwrap_or(0.0);
                    self.backpropagate(new_node, score);
                }
                None => {
                    // Nothing left to expand under this leaf (the judge
                    // declined to suggest a revision): mark it visited so
                    // selection doesn't pick it again every iteration.
                    self.backpropagate(leaf, 0.0);
                }
            }
        }

        Ok(self.rank_final_answers().await)
    }

    /// Walks from the root to a leaf, at each step picking the child with
    /// the highest UCB1 score.
    fn select_node(&self, exploration_weight: f64) -> usize {
        select_leaf(&self.nodes, self.root, exploration_weight)
    }

    /// Judges a leaf's final answer, if it has one. Non-terminal leaves
    /// (mid-plan branch tips with no `final_answer` yet) return `None`:
    /// there is nothing to score until they're expanded into a finished
    /// run.
    async fn evaluate_state(&self, idx: usize) -> Option<f64> {
        let node = &self.nodes[idx];
        let final_answer = node.final_answer.as_ref()?;
        let verdict = evaluator::evaluate_answer(
            self.task.reasoning_llm().as_ref(),
            &node.state.goal,
            final_answer,
            &node.state.current_plan,
        )
        .await?;
        Some(if verdict.accept { 1.0 } else { 0.0 })
    }

    /// Extends the tree below `idx`. An unfinished branch tip is continued
    /// with [`Task::re_execute`]; a finished one is first reflected on
    /// (could the remaining steps have done better?) and, if the judge
    /// thinks so, revised with [`Task::update`]. Returns the index of the
    /// newest grafted node, or `None` if nothing was added.
    async fn expand_node(&mut self, idx: usize) -> Result<Option<usize>> {
        let (commit_hash, state) = {
            let node = &self.nodes[idx];
            (node.commit_hash.clone(), node.state.clone())
        };

        let new_branch = if state.goal_completed {
            let final_answer = state.variables.get("final_answer").cloned().unwrap_or(Value::Null);
            let reflection = evaluator::reflect_step_on_final_answer(
                self.task.reasoning_llm().as_ref(),
                &state.goal,
                &final_answer,
                state.program_counter,
                &state.current_plan,
                None,
            )
            .await;
            if !reflection.should_optimize {
                return Ok(None);
            }
            let branch_name = format!("mcts_{}", short_hash(&commit_hash));
            self.task
                .update(branch_name.clone(), Some(commit_hash), reflection.suggestion, false, None)
                .await?;
            branch_name
        } else {
            let outcome = self.task.re_execute(None, Some(commit_hash), None).await?;
            outcome.branch_name
        };

        let commits = self.task.get_execution_details(Some(&new_branch), None).await?;
        self.graft_branch(idx, commits)
    }

    /// Adds every commit in `commits` not already in the tree as a chain of
    /// new nodes rooted at `parent`. `commits` arrives head-first (per
    /// [`Task::get_execution_details`]); it is walked oldest-first so each
    /// new node's parent is already present. Returns the newest node added.
    fn graft_branch(&mut self, parent: usize, mut commits: Vec<Commit>) -> Result<Option<usize>> {
        commits.reverse();
        let existing: HashSet<String> = self.nodes.iter().map(|n| n.commit_hash.clone()).collect();

        let mut parent = parent;
        let mut last = None;
        for commit in commits {
            if existing.contains(&commit.commit_hash) {
                continue;
            }
            let node = commit_to_node(commit, Some(parent))?;
            let idx = self.nodes.len();
            self.nodes.push(node);
            self.nodes[parent].children.push(idx);
            parent = idx;
            last = Some(idx);
        }
        Ok(last)
    }

    /// Adds one visit and `score` to `idx` and every one of its ancestors.
    fn backpropagate(&mut self, idx: usize, score: f64) {
        let mut current = Some(idx);
        while let Some(i) = current {
            self.nodes[i].visits += 1;
            self.nodes[i].value += score;
            current = self.nodes[i].parent;
        }
    }

    /// Every node bearing a final answer, ranked by the judge's score,
    /// highest first (spec.md §4.12 `sort_final_answers`).
    async fn rank_final_answers(&self) -> Vec<RankedAnswer> {
        let candidates: Vec<(String, Value)> = self
            .nodes
            .iter()
            .filter_map(|n| n.final_answer.as_ref().map(|a| (n.commit_hash.clone(), a.clone())))
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let goal = self.nodes[self.root].state.goal.clone();
        evaluator::evaluate_multiple_answers(self.task.reasoning_llm().as_ref(), &goal, &candidates)
            .await
            .into_iter()
            .map(|scored| RankedAnswer {
                commit_hash: scored.commit_hash,
                score: scored.score,
                final_answer: scored.final_answer,
            })
            .collect()
    }

    /// Runs a full optimization pass and saves the top-ranked final answer
    /// as the task's best plan. Returns the full ranking so callers can
    /// surface runner-ups too. A no-op (empty ranking, nothing saved) if
    /// the search never reached a judged final answer.
    pub async fn optimize_plan(mut self, options: OptimizerOptions) -> Result<Vec<RankedAnswer>> {
        let ranked = self.optimize(options).await?;
        if let Some(best) = ranked.first() {
            self.task.save_best_plan(&best.commit_hash).await?;
        }
        Ok(ranked)
    }
}

fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

/// Walks `nodes` from `root` to a leaf, at each step picking the child with
/// the highest UCB1 score. Free function (rather than a method) so tree
/// traversal can be exercised without a live [`Task`] backing the search.
fn select_leaf(nodes: &[TreeNode], root: usize, exploration_weight: f64) -> usize {
    let mut current = root;
    loop {
        let node = &nodes[current];
        if node.children.is_empty() {
            return current;
        }
        let parent_visits = node.visits;
        current = *node
            .children
            .iter()
            .max_by(|&&a, &&b| {
                let sa = nodes[a].ucb_score(parent_visits, exploration_weight);
                let sb = nodes[b].ucb_score(parent_visits, exploration_weight);
                sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("children checked non-empty above");
    }
}

/// Links a flat commit list into a tree by `parent_hash`. The root is the
/// one commit with no parent recorded in the task's history at all (the
/// very first `GeneratePlan` commit); a commit whose parent fell outside
/// this task's history (shouldn't happen, but commit graphs are keyed per
/// task) is treated as a root too rather than dropped.
fn build_tree(commits: Vec<Commit>) -> Result<(Vec<TreeNode>, usize)> {
    let mut by_hash: HashMap<String, usize> = HashMap::with_capacity(commits.len());
    let mut nodes = Vec::with_capacity(commits.len());
    for commit in &commits {
        by_hash.insert(commit.commit_hash.clone(), nodes.len());
        nodes.push(commit_to_node(commit.clone(), None)?);
    }

    let mut root = None;
    for commit in &commits {
        let idx = by_hash[&commit.commit_hash];
        match commit.parent_hash.as_ref().and_then(|hash| by_hash.get(hash)) {
            Some(&parent_idx) => {
                nodes[idx].parent = Some(parent_idx);
                nodes[parent_idx].children.push(idx);
            }
            None => {
                root.get_or_insert(idx);
            }
        }
    }

    root.map(|root| (nodes, root))
        .ok_or_else(|| PlanEngineError::Other("task has no commits to optimize from".into()))
}

fn commit_to_node(commit: Commit, parent: Option<usize>) -> Result<TreeNode> {
    let state: VmState = serde_json::from_value(commit.vm_state)?;
    let final_answer = if state.goal_completed {
        state.variables.get("final_answer").cloned()
    } else {
        None
    };
    Ok(TreeNode {
        commit_hash: commit.commit_hash,
        parent,
        children: Vec::new(),
        visits: 0,
        value: 0.0,
        final_answer,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_graph::{CommitMessage, CommitType};
    use chrono::Utc;

    fn commit(hash: &str, parent: Option<&str>, goal_completed: bool, final_answer: Option<&str>) -> Commit {
        let mut variables = serde_json::Map::new();
        if let Some(answer) = final_answer {
            variables.insert("final_answer".into(), Value::String(answer.into()));
        }
        let state = VmState {
            goal: "reach a decision".into(),
            current_plan: crate::plan::Plan::default(),
            reasoning: String::new(),
            program_counter: 0,
            goal_completed,
            errors: Vec::new(),
            msgs: Vec::new(),
            variables: variables.into_iter().collect(),
            variables_refs: Default::default(),
        };
        Commit {
            commit_hash: hash.into(),
            parent_hash: parent.map(str::to_string),
            message: CommitMessage {
                commit_type: CommitType::StepExecution,
                seq_no: Some(0),
                description: String::new(),
                input_parameters: Value::Null,
                output_variables: Value::Null,
                execution_error: None,
            },
            vm_state: serde_json::to_value(state).unwrap(),
            committed_at: Utc::now(),
        }
    }

    #[test]
    fn build_tree_links_children_to_their_parent() {
        let commits = vec![
            commit("a", None, false, None),
            commit("b", Some("a"), false, None),
            commit("c", Some("a"), true, Some("42")),
        ];
        let (nodes, root) = build_tree(commits).unwrap();
        assert_eq!(nodes[root].commit_hash, "a");
        assert_eq!(nodes[root].children.len(), 2);
        let answer_node = nodes.iter().find(|n| n.commit_hash == "c").unwrap();
        assert_eq!(answer_node.final_answer, Some(Value::String("42".into())));
    }

    #[test]
    fn ucb_score_is_infinite_for_unvisited_nodes() {
        let commits = vec![commit("a", None, false, None)];
        let (nodes, _) = build_tree(commits).unwrap();
        assert_eq!(nodes[0].ucb_score(10, DEFAULT_EXPLORATION_WEIGHT), f64::INFINITY);
    }

    #[test]
    fn ucb_score_rewards_fewer_visits_at_equal_value() {
        let visited = TreeNode {
            commit_hash: "v".into(),
            parent: None,
            children: Vec::new(),
            visits: 5,
            value: 5.0,
            final_answer: None,
            state: VmState::new("g", crate::plan::Plan::default(), ""),
        };
        let mut rarely_visited = visited.clone();
        rarely_visited.visits = 1;
        rarely_visited.value = 1.0;

        let w = DEFAULT_EXPLORATION_WEIGHT;
        assert!(rarely_visited.ucb_score(10, w) > visited.ucb_score(10, w));
    }

    #[test]
    fn select_node_walks_to_a_leaf() {
        let commits = vec![
            commit("a", None, false, None),
            commit("b", Some("a"), false, None),
        ];
        let (nodes, root) = build_tree(commits).unwrap();
        let leaf = select_leaf(&nodes, root, DEFAULT_EXPLORATION_WEIGHT);
        assert_eq!(nodes[leaf].commit_hash, "b");
    }

    #[test]
    fn build_tree_errors_on_empty_history() {
        assert!(build_tree(Vec::new()).is_err());
    }
}
