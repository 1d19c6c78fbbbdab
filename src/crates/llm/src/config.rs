//! Configuration for LLM provider adapters.

use crate::error::{LlmError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection details for a single LLM endpoint.
///
/// The engine holds one of these per role (plan generation, evaluation,
/// label classification) so each can point at a different model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the provider's API.
    pub base_url: String,

    /// Model name/identifier to request.
    pub model: String,

    /// API key, if the provider requires one (local servers usually don't).
    pub api_key: Option<String>,

    /// Request timeout.
    #[serde(default = "default_timeout")]
    pub timeout: Duration,

    /// Maximum retry attempts on transient failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl ProviderConfig {
    /// Create a new configuration.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            timeout: default_timeout(),
            max_retries: default_max_retries(),
        }
    }

    /// Build a configuration from environment variables, erroring if the
    /// API key variable is set but empty, or absent when `require_key` is set.
    pub fn from_env(
        base_url_var: &str,
        model_var: &str,
        api_key_var: &str,
        require_key: bool,
    ) -> Result<Self> {
        let base_url = std::env::var(base_url_var)
            .map_err(|_| LlmError::ConfigError(format!("missing {}", base_url_var)))?;
        let model = std::env::var(model_var)
            .map_err(|_| LlmError::ConfigError(format!("missing {}", model_var)))?;
        let api_key = match std::env::var(api_key_var) {
            Ok(key) if !key.is_empty() => Some(key),
            _ if require_key => {
                return Err(LlmError::ApiKeyNotFound(api_key_var.to_string()));
            }
            _ => None,
        };

        Ok(Self {
            base_url,
            model,
            api_key,
            timeout: default_timeout(),
            max_retries: default_max_retries(),
        })
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_retries() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let config = ProviderConfig::new("http://localhost:11434", "llama3")
            .with_timeout(Duration::from_secs(30))
            .with_max_retries(5)
            .with_api_key("local-token");

        assert_eq!(config.base_url, "http://localhost:11434");
        assert_eq!(config.model, "llama3");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.api_key.as_deref(), Some("local-token"));
    }

    #[test]
    fn from_env_requires_key_when_asked() {
        std::env::remove_var("TEST_LLM_BASE_URL");
        std::env::remove_var("TEST_LLM_MODEL");
        std::env::remove_var("TEST_LLM_KEY");
        std::env::set_var("TEST_LLM_BASE_URL", "https://api.example.com");
        std::env::set_var("TEST_LLM_MODEL", "gpt-4");

        let err = ProviderConfig::from_env(
            "TEST_LLM_BASE_URL",
            "TEST_LLM_MODEL",
            "TEST_LLM_KEY",
            true,
        )
        .unwrap_err();
        assert!(matches!(err, LlmError::ApiKeyNotFound(_)));

        std::env::set_var("TEST_LLM_KEY", "secret");
        let config = ProviderConfig::from_env(
            "TEST_LLM_BASE_URL",
            "TEST_LLM_MODEL",
            "TEST_LLM_KEY",
            true,
        )
        .unwrap();
        assert_eq!(config.api_key.as_deref(), Some("secret"));

        std::env::remove_var("TEST_LLM_BASE_URL");
        std::env::remove_var("TEST_LLM_MODEL");
        std::env::remove_var("TEST_LLM_KEY");
    }
}
