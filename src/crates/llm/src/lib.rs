//! LLM provider contract used by the plan execution engine.
//!
//! This crate deliberately does not ship concrete provider clients (OpenAI,
//! Claude, Ollama, ...). Those are external collaborators: anything that can
//! answer `generate`/`generate_stream` over HTTP or a local process satisfies
//! [`LlmProvider`]. What lives here is the trait contract itself, a
//! configuration shape for wiring up an adapter, and a [`MockProvider`] used
//! throughout the engine's test suite.
//!
//! # Example
//!
//! ```
//! use llm::{LlmProvider, MockProvider};
//!
//! # async fn run() -> llm::Result<()> {
//! let provider = MockProvider::with_response("hello");
//! let text = provider.generate("say hi", None).await?;
//! assert_eq!(text, "hello");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;

pub use config::ProviderConfig;
pub use error::{LlmError, Result};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use std::sync::Mutex;

/// A single chunk of a streamed generation, forwarded to callers as it
/// arrives from the provider.
pub type TextChunk = Result<String>;

/// A stream of text chunks produced by [`LlmProvider::generate_stream`].
pub type TextStream = BoxStream<'static, TextChunk>;

/// Contract every LLM provider adapter must satisfy.
///
/// `prompt` is the fully assembled instruction text; `context` is an
/// optional secondary block (e.g. the variable values a `jmp` condition
/// should be evaluated against) that a provider may fold into the prompt
/// however it sees fit.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a complete response and return it once finished.
    async fn generate(&self, prompt: &str, context: Option<&str>) -> Result<String>;

    /// Generate a response, yielding it incrementally as text chunks.
    ///
    /// The default implementation falls back to [`generate`](Self::generate)
    /// and emits the whole response as a single chunk; providers that support
    /// token streaming should override this.
    async fn generate_stream(&self, prompt: &str, context: Option<&str>) -> Result<TextStream> {
        let text = self.generate(prompt, context).await;
        Ok(Box::pin(stream::once(async move { text })))
    }

    /// Whether this provider is currently reachable/configured. Used by
    /// health checks; defaults to `true`.
    fn is_available(&self) -> bool {
        true
    }

    /// Clone this provider behind a fresh box. Required so `Box<dyn
    /// LlmProvider>` values can be cloned when a plan fans out concurrent
    /// tool calls that each hold their own handle.
    fn clone_box(&self) -> Box<dyn LlmProvider>;
}

impl Clone for Box<dyn LlmProvider> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// A scripted provider for tests: returns a fixed response, or a queue of
/// responses consumed in order across successive calls.
pub struct MockProvider {
    responses: Mutex<Vec<String>>,
    fail_after: Option<usize>,
    calls: Mutex<usize>,
}

impl MockProvider {
    /// Always return the same response.
    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(vec![response.into()]),
            fail_after: None,
            calls: Mutex::new(0),
        }
    }

    /// Return responses in order; once exhausted, repeat the last one.
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses),
            fail_after: None,
            calls: Mutex::new(0),
        }
    }

    /// Fail every call starting from the `n`th (0-indexed).
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Number of times `generate`/`generate_stream` has been invoked.
    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn generate(&self, _prompt: &str, _context: Option<&str>) -> Result<String> {
        let mut calls = self.calls.lock().unwrap();
        let idx = *calls;
        *calls += 1;

        if let Some(fail_after) = self.fail_after {
            if idx >= fail_after {
                return Err(LlmError::ProviderError("mock provider exhausted".into()));
            }
        }

        let responses = self.responses.lock().unwrap();
        let response = responses
            .get(idx)
            .or_else(|| responses.last())
            .cloned()
            .unwrap_or_default();
        Ok(response)
    }

    fn clone_box(&self) -> Box<dyn LlmProvider> {
        let responses = self.responses.lock().unwrap().clone();
        Box::new(MockProvider {
            responses: Mutex::new(responses),
            fail_after: self.fail_after,
            calls: Mutex::new(*self.calls.lock().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_returns_fixed_response() {
        let provider = MockProvider::with_response("42");
        assert_eq!(provider.generate("what is it", None).await.unwrap(), "42");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn mock_cycles_through_responses() {
        let provider = MockProvider::with_responses(vec!["a".into(), "b".into()]);
        assert_eq!(provider.generate("", None).await.unwrap(), "a");
        assert_eq!(provider.generate("", None).await.unwrap(), "b");
        assert_eq!(provider.generate("", None).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn mock_fails_after_threshold() {
        let provider = MockProvider::with_response("ok").failing_after(1);
        assert!(provider.generate("", None).await.is_ok());
        assert!(provider.generate("", None).await.is_err());
    }

    #[tokio::test]
    async fn default_stream_yields_single_chunk() {
        use futures::StreamExt;

        let provider = MockProvider::with_response("streamed");
        let mut stream = provider.generate_stream("", None).await.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk, "streamed");
        assert!(stream.next().await.is_none());
    }
}
