//! OpenAI-compatible chat-completions client.
//!
//! Grounded on `original_source/app/llm/providers/openai_like.py`: any
//! endpoint that speaks the OpenAI `chat/completions` wire format (OpenAI
//! itself, Ollama, vLLM, LM Studio, ...) is reachable through one base URL +
//! model + optional API key, which is exactly the shape `llm::ProviderConfig`
//! already carries. `context` is folded into the prompt the same way the
//! Python original does it (`f"{context}\n{prompt}"`), and failed requests
//! are retried with exponential backoff up to `max_retries` times.

use async_trait::async_trait;
use llm::{LlmError, LlmProvider, ProviderConfig, Result};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("reqwest client configuration is valid");
        Self { config, client }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    async fn request_once(&self, full_prompt: &str) -> Result<String> {
        let mut request = self.client.post(self.endpoint()).json(&json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": full_prompt}],
        }));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthenticationError(body),
                404 => LlmError::ModelNotFound(self.config.model.clone()),
                429 => LlmError::RateLimitExceeded(body),
                503 => LlmError::ServiceUnavailable(body),
                _ => LlmError::ProviderError(format!("{status}: {body}")),
            });
        }

        let body: ChatCompletionResponse = response.json().await?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices in response".into()))?;
        Ok(choice.message.content.trim().to_string())
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn generate(&self, prompt: &str, context: Option<&str>) -> Result<String> {
        let full_prompt = match context {
            Some(context) => format!("{context}\n{prompt}"),
            None => prompt.to_string(),
        };

        let mut attempt = 0u32;
        loop {
            match self.request_once(&full_prompt).await {
                Ok(text) => return Ok(text),
                Err(err) if attempt < self.config.max_retries && err.is_retryable() => {
                    let backoff = Duration::from_millis(250 * 2u64.pow(attempt));
                    tracing::warn!(attempt, ?backoff, error = %err, "retrying llm request");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn is_available(&self) -> bool {
        !self.config.base_url.is_empty()
    }

    fn clone_box(&self) -> Box<dyn LlmProvider> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_strips_trailing_slash() {
        let provider = OpenAiCompatibleProvider::new(ProviderConfig::new("http://localhost:11434/", "llama3"));
        assert_eq!(provider.endpoint(), "http://localhost:11434/chat/completions");
    }

    #[test]
    fn unavailable_without_base_url() {
        let provider = OpenAiCompatibleProvider::new(ProviderConfig::new("", "llama3"));
        assert!(!provider.is_available());
    }
}
