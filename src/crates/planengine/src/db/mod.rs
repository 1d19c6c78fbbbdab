//! Database connection pooling, grounded on `orchestrator::db::connection`.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Executor;

/// Shared SQLite pool. The relational commit graph, task repository, and
/// label/namespace tables all share one pool per process.
#[derive(Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn raw(&self) -> &SqlitePool {
        &self.pool
    }

    /// Round-trips a trivial query against the pool. Used by the `/health`
    /// endpoint to report database connectivity.
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        self.pool.execute("SELECT 1").await.map(|_| ())
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        self.pool
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    goal TEXT NOT NULL,
                    status TEXT NOT NULL,
                    meta TEXT,
                    best_plan TEXT,
                    namespace TEXT,
                    label TEXT,
                    evaluation_status TEXT NOT NULL DEFAULT 'NOT_EVALUATED',
                    evaluation_reason TEXT,
                    human_evaluation_status TEXT NOT NULL DEFAULT 'NOT_EVALUATED',
                    human_evaluation_reason TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS commits (
                    commit_hash TEXT PRIMARY KEY,
                    parent_hash TEXT,
                    task_id TEXT NOT NULL,
                    message TEXT NOT NULL,
                    vm_state TEXT NOT NULL,
                    committed_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS branches (
                    name TEXT NOT NULL,
                    task_id TEXT NOT NULL,
                    head_commit_hash TEXT NOT NULL,
                    UNIQUE(name, task_id)
                );

                CREATE TABLE IF NOT EXISTS task_active_branch (
                    task_id TEXT PRIMARY KEY,
                    branch_name TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS namespaces (
                    name TEXT PRIMARY KEY,
                    allowed_tools TEXT NOT NULL,
                    description TEXT
                );

                CREATE TABLE IF NOT EXISTS labels (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT,
                    best_practices TEXT,
                    parent_id TEXT,
                    namespace_name TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS label_tasks (
                    label_id TEXT NOT NULL,
                    task_id TEXT NOT NULL
                );
                "#,
            )
            .await?;
        Ok(())
    }
}
