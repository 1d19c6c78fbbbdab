//! Standalone server binary: boots the engine's collaborators from
//! environment configuration and serves the HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use planengine::api::routes::{create_router, AppState};
use planengine::cache::PlanCache;
use planengine::config::{ConfigBuilder, EngineConfig, LlmEndpoints};
use planengine::db::DatabasePool;
use planengine::labels::LabelClassifier;
use planengine::providers::OpenAiCompatibleProvider;
use planengine::task::queue::TaskQueue;
use planengine::task::TaskManager;
use planengine::tools::ToolRegistry;
use llm::LlmProvider;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let config = EngineConfig::from_env("PLANENGINE_")?;
    config.validate()?;
    tracing::info!(database_url = %config.database_url, workers = config.task_queue_workers, "engine configuration loaded");

    let endpoints = LlmEndpoints::from_env()?;
    let plan_llm: Arc<dyn LlmProvider> = Arc::new(OpenAiCompatibleProvider::new(endpoints.plan_generation));
    let eval_llm: Arc<dyn LlmProvider> = Arc::new(OpenAiCompatibleProvider::new(endpoints.evaluation));
    let label_llm: Arc<dyn LlmProvider> = Arc::new(OpenAiCompatibleProvider::new(endpoints.label_classification));

    tracing::info!("connecting to database");
    let db = DatabasePool::connect(&config.database_url).await?;
    db.health_check().await?;

    let vm_spec = tokio::fs::read_to_string(&config.vm_spec_path)
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(path = %config.vm_spec_path, error = %err, "vm spec file unreadable, serving an empty spec");
            String::new()
        });

    let classifier = Arc::new(LabelClassifier::new(db.clone(), label_llm));
    let cache = Arc::new(PlanCache::new(db.clone()));
    let tools = ToolRegistry::new();

    let tasks = Arc::new(TaskManager::new(db.clone(), plan_llm, eval_llm, tools, classifier, cache, vm_spec));

    let queue = Arc::new(TaskQueue::start(
        config.task_queue_workers,
        Duration::from_secs(config.task_queue_timeout_secs),
    ));

    let app_state = AppState { db, tasks, queue, config: Arc::new(config) };
    let router = create_router(app_state);

    let port: u16 = std::env::var("PORT").unwrap_or_else(|_| "8000".to_string()).parse()?;
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    tracing::info!(%addr, "starting planengine server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("planengine server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install CTRL-C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received CTRL-C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
