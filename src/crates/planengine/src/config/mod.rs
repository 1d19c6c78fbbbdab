//! Engine configuration, loaded from environment variables (spec.md §6
//! "Environment").
//!
//! Grounded on `tooling::config::{ConfigBuilder, get_env_or,
//! get_env_parse_or}` for the scalar settings; the LLM endpoints themselves
//! are loaded through `llm::ProviderConfig::from_env`, one instance per
//! role (plan generation/reasoning, evaluation, label classification).

use llm::ProviderConfig;
use tooling::config::{get_env_or, get_env_parse_or, ConfigBuilder};
use tooling::Result;

/// Everything the engine needs to boot: storage location, queue sizing,
/// CORS policy, and the markdown fed to the plan generator as VM spec and
/// example text.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub cors_allowed_origins: Vec<String>,
    pub task_queue_workers: usize,
    pub task_queue_timeout_secs: u64,
    pub vm_spec_path: String,
    pub plan_example_path: String,
    pub generated_files_dir: String,
    pub external_knowledge_base_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://planengine.db".to_string(),
            cors_allowed_origins: vec!["*".to_string()],
            task_queue_workers: 4,
            task_queue_timeout_secs: 300,
            vm_spec_path: "docs/vm_spec.md".to_string(),
            plan_example_path: "docs/plan_example.md".to_string(),
            generated_files_dir: "generated".to_string(),
            external_knowledge_base_url: None,
        }
    }
}

impl ConfigBuilder for EngineConfig {
    fn validate(&self) -> Result<()> {
        if self.task_queue_workers == 0 {
            return Err(tooling::ToolingError::General(
                "task_queue_workers must be non-zero".into(),
            ));
        }
        Ok(())
    }

    fn from_env(prefix: &str) -> Result<Self> {
        let key = |name: &str| format!("{prefix}{name}");
        Ok(Self {
            database_url: get_env_or(&key("DATABASE_URL"), "sqlite://planengine.db")?,
            cors_allowed_origins: get_env_or(&key("CORS_ALLOWED_ORIGINS"), "*")?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            task_queue_workers: get_env_parse_or(&key("TASK_QUEUE_WORKERS"), 4usize)?,
            task_queue_timeout_secs: get_env_parse_or(&key("TASK_QUEUE_TIMEOUT"), 300u64)?,
            vm_spec_path: get_env_or(&key("VM_SPEC_PATH"), "docs/vm_spec.md")?,
            plan_example_path: get_env_or(&key("PLAN_EXAMPLE_PATH"), "docs/plan_example.md")?,
            generated_files_dir: get_env_or(&key("GENERATED_FILES_DIR"), "generated")?,
            external_knowledge_base_url: std::env::var(key("KNOWLEDGE_BASE_URL")).ok(),
        })
    }

    fn merge(&mut self, other: Self) -> &mut Self {
        if other.database_url != Self::default().database_url {
            self.database_url = other.database_url;
        }
        if other.external_knowledge_base_url.is_some() {
            self.external_knowledge_base_url = other.external_knowledge_base_url;
        }
        self
    }
}

/// One reasoning-capable LLM endpoint per role the engine needs.
#[derive(Debug, Clone)]
pub struct LlmEndpoints {
    pub plan_generation: ProviderConfig,
    pub evaluation: ProviderConfig,
    pub label_classification: ProviderConfig,
}

impl LlmEndpoints {
    /// Loads all three endpoints from environment variables, falling back
    /// to the plan-generation endpoint for roles whose own variables are
    /// unset (a single-provider deployment need only set one).
    pub fn from_env() -> llm::Result<Self> {
        let plan_generation =
            ProviderConfig::from_env("LLM_BASE_URL", "LLM_MODEL", "LLM_API_KEY", false)?;
        let evaluation = ProviderConfig::from_env(
            "EVAL_LLM_BASE_URL",
            "EVAL_LLM_MODEL",
            "EVAL_LLM_API_KEY",
            false,
        )
        .unwrap_or_else(|_| plan_generation.clone());
        let label_classification = ProviderConfig::from_env(
            "LABEL_LLM_BASE_URL",
            "LABEL_LLM_MODEL",
            "LABEL_LLM_API_KEY",
            false,
        )
        .unwrap_or_else(|_| plan_generation.clone());

        Ok(Self { plan_generation, evaluation, label_classification })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn from_env_reads_overrides() {
        std::env::set_var("PE_TEST_TASK_QUEUE_WORKERS", "8");
        std::env::set_var("PE_TEST_CORS_ALLOWED_ORIGINS", "https://a.test, https://b.test");
        let config = EngineConfig::from_env("PE_TEST_").unwrap();
        assert_eq!(config.task_queue_workers, 8);
        assert_eq!(
            config.cors_allowed_origins,
            vec!["https://a.test".to_string(), "https://b.test".to_string()]
        );
        std::env::remove_var("PE_TEST_TASK_QUEUE_WORKERS");
        std::env::remove_var("PE_TEST_CORS_ALLOWED_ORIGINS");
    }

    #[test]
    fn zero_workers_fails_validation() {
        let config = EngineConfig { task_queue_workers: 0, ..EngineConfig::default() };
        assert!(config.validate().is_err());
    }
}
