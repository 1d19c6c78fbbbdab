//! Label classifier: a per-namespace hierarchy of labels used to retrieve
//! few-shot task examples and best-practices hints for the plan generator
//! (spec.md §4.7).
//!
//! Grounded on `original_source/app/controller/label_classifier.py`: the
//! tree is rebuilt from storage on every classification (no incremental
//! cache), the LLM is asked for a path from root to leaf, and the path is
//! resolved against the tree by longest-prefix match rather than trusting
//! the LLM's labels to already exist.

use crate::db::DatabasePool;
use llm::LlmProvider;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;

/// A single node in a namespace's label tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub best_practices: Option<String>,
    pub parent_id: Option<String>,
}

/// A past task attached to a label, used as a few-shot example.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExample {
    pub task_id: String,
    pub goal: String,
    pub best_plan: Option<Value>,
}

/// One entry of a label path returned by the LLM. Accepts both the bare
/// `["A", "B"]` form and the richer `[{"label": "A", "description": "..."},
/// ...]` form used when creating new labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelPathEntry {
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Result of classifying a goal against a namespace's label tree.
#[derive(Debug, Clone)]
pub struct Classification {
    pub label_path: Vec<String>,
    pub most_similar_task: Option<TaskExample>,
    pub best_practices: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    #[error("llm request failed: {0}")]
    Llm(#[from] llm::LlmError),
    #[error("label path malformed: {0}")]
    MalformedPath(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("task {0} not found")]
    TaskNotFound(String),
}

pub type Result<T> = std::result::Result<T, LabelError>;

struct TreeNode {
    label: Label,
    children: Vec<String>,
    tasks: Vec<TaskExample>,
}

/// A namespace's label hierarchy plus the task examples attached to each
/// node, loaded fresh from storage for each classification.
struct LabelTree {
    roots: Vec<String>,
    nodes: HashMap<String, TreeNode>,
}

impl LabelTree {
    async fn load(db: &DatabasePool, namespace: &str) -> Result<Self> {
        let label_rows = sqlx::query(
            "SELECT id, name, description, best_practices, parent_id FROM labels WHERE namespace_name = ?",
        )
        .bind(namespace)
        .fetch_all(db.raw())
        .await?;

        let mut nodes = HashMap::new();
        let mut roots = Vec::new();
        for row in &label_rows {
            let label = Label {
                id: row.get("id"),
                name: row.get("name"),
                description: row.get("description"),
                best_practices: row.get("best_practices"),
                parent_id: row.get("parent_id"),
            };
            if label.parent_id.is_none() {
                roots.push(label.id.clone());
            }
            nodes.insert(
                label.id.clone(),
                TreeNode { label, children: Vec::new(), tasks: Vec::new() },
            );
        }
        let parent_links: Vec<(String, String)> = nodes
            .values()
            .filter_map(|n| n.label.parent_id.clone().map(|p| (p, n.label.id.clone())))
            .collect();
        for (parent, child) in parent_links {
            if let Some(parent_node) = nodes.get_mut(&parent) {
                parent_node.children.push(child);
            }
        }

        let task_rows = sqlx::query(
            "SELECT label_tasks.label_id AS label_id, tasks.id AS task_id, tasks.goal AS goal, tasks.best_plan AS best_plan
             FROM label_tasks
             JOIN tasks ON tasks.id = label_tasks.task_id
             WHERE tasks.namespace = ? AND tasks.best_plan IS NOT NULL",
        )
        .bind(namespace)
        .fetch_all(db.raw())
        .await?;
        for row in task_rows {
            let label_id: String = row.get("label_id");
            let best_plan: Option<String> = row.get("best_plan");
            let example = TaskExample {
                task_id: row.get("task_id"),
                goal: row.get("goal"),
                best_plan: best_plan.and_then(|s| serde_json::from_str(&s).ok()),
            };
            if let Some(node) = nodes.get_mut(&label_id) {
                node.tasks.push(example);
            }
        }

        Ok(Self { roots, nodes })
    }

    fn light_tree(&self) -> Value {
        fn render(tree: &LabelTree, id: &str) -> Value {
            let node = &tree.nodes[id];
            serde_json::json!({
                "label": node.label.name,
                "description": node.label.description.clone().unwrap_or_default(),
                "tasks": node.tasks.iter().map(|t| t.goal.clone()).collect::<Vec<_>>(),
                "children": node.children.iter().map(|c| render(tree, c)).collect::<Vec<_>>(),
            })
        }
        Value::Array(self.roots.iter().map(|id| render(self, id)).collect())
    }

    fn task_list(&self) -> Value {
        fn collect(tree: &LabelTree, id: &str, path: &[String], out: &mut Vec<Value>) {
            let node = &tree.nodes[id];
            let mut path = path.to_vec();
            path.push(node.label.name.clone());
            for task in &node.tasks {
                out.push(serde_json::json!({ "task_goal": task.goal, "labels": path }));
            }
            for child in &node.children {
                collect(tree, child, &path, out);
            }
        }
        let mut out = Vec::new();
        for id in &self.roots {
            collect(self, id, &[], &mut out);
        }
        Value::Array(out)
    }

    /// Walks `path` from the tree roots, matching by name one level at a
    /// time, and returns the deepest node reached. Stops as soon as a name
    /// in the path has no matching child, rather than failing outright.
    fn longest_matching(&self, path: &[LabelPathEntry]) -> Option<&str> {
        let mut candidates = &self.roots;
        let mut matched: Option<&str> = None;
        for entry in path {
            let found = candidates
                .iter()
                .find(|id| self.nodes[id.as_str()].label.name == entry.label)?;
            matched = Some(found.as_str());
            candidates = &self.nodes[found.as_str()].children;
        }
        matched
    }

    fn tasks_under(&self, id: &str) -> Vec<TaskExample> {
        let node = &self.nodes[id];
        let mut tasks = node.tasks.clone();
        for child in &node.children {
            tasks.extend(self.tasks_under(child));
        }
        tasks
    }

    /// Nearest non-empty `best_practices`, walking the path from leaf to root.
    fn nearest_best_practices(&self, path: &[LabelPathEntry]) -> Option<String> {
        let mut candidates = &self.roots;
        let mut trail: Vec<&str> = Vec::new();
        for entry in path {
            let found = candidates
                .iter()
                .find(|id| self.nodes[id.as_str()].label.name == entry.label)?;
            trail.push(found.as_str());
            candidates = &self.nodes[found.as_str()].children;
        }
        trail
            .into_iter()
            .rev()
            .find_map(|id| self.nodes[id].label.best_practices.clone())
    }

    fn find_child(&self, db_parent: Option<&str>, name: &str) -> Option<&str> {
        let siblings = match db_parent {
            Some(parent) => &self.nodes[parent].children,
            None => &self.roots,
        };
        siblings
            .iter()
            .find(|id| self.nodes[id.as_str()].label.name == name)
            .map(|s| s.as_str())
    }
}

fn most_similar(goal: &str, candidates: &[TaskExample]) -> Option<TaskExample> {
    candidates
        .iter()
        .find(|t| t.goal == goal)
        .or_else(|| candidates.first())
        .cloned()
}

/// Parses the LLM's freeform response into a label path, accepting both
/// `["A", "B"]` and `[{"label": "A"}, ...]`.
fn parse_label_path(raw: &str) -> Result<Vec<LabelPathEntry>> {
    let array_text = crate::plan::parser::extract_json_array(raw)
        .ok_or_else(|| LabelError::MalformedPath("no JSON array found in response".into()))?;
    let values: Vec<Value> = serde_json::from_str(&array_text)
        .map_err(|e| LabelError::MalformedPath(e.to_string()))?;
    if values.is_empty() {
        return Err(LabelError::MalformedPath("label path is empty".into()));
    }

    values
        .into_iter()
        .map(|v| match v {
            Value::String(label) => Ok(LabelPathEntry { label, description: None }),
            Value::Object(_) => serde_json::from_value(v)
                .map_err(|e| LabelError::MalformedPath(e.to_string())),
            other => Err(LabelError::MalformedPath(format!(
                "expected a label name or object, got {other}"
            ))),
        })
        .collect()
}

/// Builds the classification prompt from the namespace's simplified tree
/// and known task goals.
fn classification_prompt(goal: &str, light_tree: &Value, task_list: &Value) -> String {
    format!(
        "Classify the following task goal into a label path within the existing \
         label tree. Return a JSON array of label names from root to leaf; reuse \
         existing labels where they fit and introduce new ones only when nothing \
         in the tree matches.\n\n\
         Task goal: {goal}\n\n\
         Existing label tree:\n{tree}\n\n\
         Known task goals by label path:\n{tasks}\n",
        tree = serde_json::to_string_pretty(light_tree).unwrap_or_default(),
        tasks = serde_json::to_string_pretty(task_list).unwrap_or_default(),
    )
}

/// Classifies goals against a namespace's label hierarchy and grows that
/// hierarchy as new task examples are recorded.
pub struct LabelClassifier {
    db: DatabasePool,
    llm: Arc<dyn LlmProvider>,
}

impl LabelClassifier {
    pub fn new(db: DatabasePool, llm: Arc<dyn LlmProvider>) -> Self {
        Self { db, llm }
    }

    /// Generates a label path for `goal` within `namespace`, resolves it
    /// against the existing tree, and surfaces the best few-shot example
    /// and best-practices hint available at that point in the tree.
    pub async fn generate_label_path(&self, namespace: &str, goal: &str) -> Result<Classification> {
        let tree = LabelTree::load(&self.db, namespace).await?;
        let prompt = classification_prompt(goal, &tree.light_tree(), &tree.task_list());
        let response = self.llm.generate(&prompt, None).await?;
        let path = parse_label_path(&response)?;

        let label_path = path.iter().map(|e| e.label.clone()).collect();
        let Some(matched) = tree.longest_matching(&path) else {
            return Ok(Classification { label_path, most_similar_task: None, best_practices: None });
        };

        let candidates = tree.tasks_under(matched);
        if candidates.is_empty() {
            return Ok(Classification { label_path, most_similar_task: None, best_practices: None });
        }

        Ok(Classification {
            label_path,
            most_similar_task: most_similar(goal, &candidates),
            best_practices: tree.nearest_best_practices(&path),
        })
    }

    /// Creates any labels missing along `label_path` and attaches `task_id`
    /// to the leaf label.
    pub async fn insert_label_path(
        &self,
        namespace: &str,
        task_id: &str,
        label_path: &[LabelPathEntry],
    ) -> Result<()> {
        let mut tree = LabelTree::load(&self.db, namespace).await?;
        let mut parent: Option<String> = None;

        for entry in label_path {
            if let Some(existing) = tree.find_child(parent.as_deref(), &entry.label) {
                parent = Some(existing.to_string());
                continue;
            }

            let id = uuid::Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO labels (id, name, description, best_practices, parent_id, namespace_name) VALUES (?, ?, ?, NULL, ?, ?)",
            )
            .bind(&id)
            .bind(&entry.label)
            .bind(&entry.description)
            .bind(&parent)
            .bind(namespace)
            .execute(self.db.raw())
            .await?;

            tree.nodes.insert(
                id.clone(),
                TreeNode {
                    label: Label {
                        id: id.clone(),
                        name: entry.label.clone(),
                        description: entry.description.clone(),
                        best_practices: None,
                        parent_id: parent.clone(),
                    },
                    children: Vec::new(),
                    tasks: Vec::new(),
                },
            );
            match &parent {
                Some(p) => tree.nodes.get_mut(p).unwrap().children.push(id.clone()),
                None => tree.roots.push(id.clone()),
            }
            parent = Some(id);
        }

        let Some(leaf) = parent else {
            return Err(LabelError::MalformedPath("label path is empty".into()));
        };

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(self.db.raw())
            .await?;
        if exists.is_none() {
            return Err(LabelError::TaskNotFound(task_id.to_string()));
        }

        sqlx::query("INSERT INTO label_tasks (label_id, task_id) VALUES (?, ?)")
            .bind(&leaf)
            .bind(task_id)
            .execute(self.db.raw())
            .await?;
        sqlx::query("UPDATE tasks SET label = ? WHERE id = ?")
            .bind(&leaf)
            .bind(task_id)
            .execute(self.db.raw())
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm::MockProvider;

    async fn seed(db: &DatabasePool, namespace: &str) {
        sqlx::query(
            "INSERT INTO labels (id, name, description, best_practices, parent_id, namespace_name) VALUES (?, ?, ?, ?, NULL, ?)",
        )
        .bind("root")
        .bind("Operations")
        .bind("top-level operational tasks")
        .bind("always confirm before destructive actions")
        .bind(namespace)
        .execute(db.raw())
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO labels (id, name, description, best_practices, parent_id, namespace_name) VALUES (?, ?, ?, NULL, ?, ?)",
        )
        .bind("child")
        .bind("Replication")
        .bind("replication setup and repair")
        .bind("root")
        .bind(namespace)
        .execute(db.raw())
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO tasks (id, goal, status, best_plan, namespace, created_at, updated_at) VALUES (?, ?, 'completed', ?, ?, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
        )
        .bind("task-1")
        .bind("configure replication")
        .bind(r#"{"steps": []}"#)
        .bind(namespace)
        .execute(db.raw())
        .await
        .unwrap();

        sqlx::query("INSERT INTO label_tasks (label_id, task_id) VALUES (?, ?)")
            .bind("child")
            .bind("task-1")
            .execute(db.raw())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn generate_label_path_resolves_longest_prefix_and_example() {
        let db = DatabasePool::connect("sqlite::memory:").await.unwrap();
        seed(&db, "ns").await;
        let llm = Arc::new(MockProvider::with_response(
            r#"["Operations", "Replication"]"#,
        ));
        let classifier = LabelClassifier::new(db, llm);

        let classification = classifier.generate_label_path("ns", "configure replication").await.unwrap();
        assert_eq!(classification.label_path, vec!["Operations", "Replication"]);
        assert_eq!(classification.most_similar_task.unwrap().task_id, "task-1");
        assert_eq!(
            classification.best_practices.unwrap(),
            "replication setup and repair"
        );
    }

    #[tokio::test]
    async fn generate_label_path_falls_back_to_parent_best_practices() {
        let db = DatabasePool::connect("sqlite::memory:").await.unwrap();
        seed(&db, "ns").await;
        // "Replication" exists but carries no best_practices of its own.
        let llm = Arc::new(MockProvider::with_response(r#"[{"label": "Operations"}]"#));
        let classifier = LabelClassifier::new(db, llm);

        let classification = classifier.generate_label_path("ns", "anything").await.unwrap();
        assert_eq!(
            classification.best_practices.unwrap(),
            "always confirm before destructive actions"
        );
    }

    #[tokio::test]
    async fn generate_label_path_with_unknown_labels_returns_no_example() {
        let db = DatabasePool::connect("sqlite::memory:").await.unwrap();
        seed(&db, "ns").await;
        let llm = Arc::new(MockProvider::with_response(r#"["Unrelated"]"#));
        let classifier = LabelClassifier::new(db, llm);

        let classification = classifier.generate_label_path("ns", "anything").await.unwrap();
        assert!(classification.most_similar_task.is_none());
        assert!(classification.best_practices.is_none());
    }

    #[tokio::test]
    async fn malformed_response_is_rejected() {
        let db = DatabasePool::connect("sqlite::memory:").await.unwrap();
        seed(&db, "ns").await;
        let llm = Arc::new(MockProvider::with_response("not json at all"));
        let classifier = LabelClassifier::new(db, llm);

        let result = classifier.generate_label_path("ns", "anything").await;
        assert!(matches!(result, Err(LabelError::MalformedPath(_))));
    }

    #[tokio::test]
    async fn insert_label_path_creates_missing_labels_and_attaches_task() {
        let db = DatabasePool::connect("sqlite::memory:").await.unwrap();
        seed(&db, "ns").await;
        sqlx::query(
            "INSERT INTO tasks (id, goal, status, namespace, created_at, updated_at) VALUES ('task-2', 'new goal', 'completed', 'ns', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
        )
        .execute(db.raw())
        .await
        .unwrap();

        let llm = Arc::new(MockProvider::with_response(""));
        let classifier = LabelClassifier::new(db.clone(), llm);
        let path = vec![
            LabelPathEntry { label: "Operations".into(), description: None },
            LabelPathEntry { label: "Backups".into(), description: Some("backup and restore".into()) },
        ];
        classifier.insert_label_path("ns", "task-2", &path).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM labels WHERE namespace_name = 'ns'")
            .fetch_one(db.raw())
            .await
            .unwrap();
        assert_eq!(count, 3); // Operations, Replication (seeded), Backups (new)

        let attached: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM label_tasks lt JOIN labels l ON l.id = lt.label_id WHERE lt.task_id = 'task-2' AND l.name = 'Backups'",
        )
        .fetch_one(db.raw())
        .await
        .unwrap();
        assert_eq!(attached, 1);
    }
}
