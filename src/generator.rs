//! Generator abstraction and implementations
//!
//! Provides the [`Generator`] trait and two implementations:
//! - [`EchoGenerator`]: testing/demo generator that hands back the parent program
//! - [`OpenAiCompatibleGenerator`]: any `/chat/completions` endpoint
//!
//! ## Environment Variables
//!
//! - The API key for [`OpenAiCompatibleGenerator::from_env`] is read from the
//!   variable named by the caller (conventionally `OPENAI_API_KEY`).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, GenerationConfig};

/// Failure of a single generator call.
///
/// Every variant is recoverable: the controller retries with backoff and
/// abandons the iteration once attempts run out.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    /// The provider asked us to slow down.
    #[error("rate limited")]
    RateLimited,

    /// The call did not finish within its timeout.
    #[error("timeout")]
    Timeout,

    /// The provider answered, but not with usable program text.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Transport failure or server-side error.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl GenerationError {
    /// Short label for metrics and failure statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Sampling parameters forwarded with every request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token limit.
    pub max_tokens: u32,
}

impl From<&GenerationConfig> for GenerationParams {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// Trait for program generators.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via `Arc<dyn Generator>`.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce new candidate source text for `prompt`.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerationError>;
}

/// Extract program text from a model reply.
///
/// Returns the body of the first fenced block (```` ```lang ... ``` ````),
/// dropping the language tag. Replies without a complete fence are returned
/// trimmed.
pub fn extract_code_block(reply: &str) -> String {
    const FENCE: &str = "```";
    let Some(open) = reply.find(FENCE) else {
        return reply.trim().to_string();
    };
    let after_fence = &reply[open + FENCE.len()..];
    let body_start = after_fence.find('\n').map_or(after_fence.len(), |i| i + 1);
    let body = &after_fence[body_start..];
    match body.find(FENCE) {
        Some(close) => body[..close].trim_end().to_string(),
        None => reply.trim().to_string(),
    }
}

// ============================================================================
// Echo Generator (Testing)
// ============================================================================

/// Dummy generator for testing.
///
/// Returns the first fenced block of the prompt (the parent program in the
/// default template) unchanged, after a simulated delay. Useful for loop
/// smoke tests without a real model.
pub struct EchoGenerator {
    /// Simulated generation delay.
    pub delay_ms: u64,
}

impl EchoGenerator {
    /// Echo generator with a 10 ms delay.
    pub fn new() -> Self {
        Self { delay_ms: 10 }
    }

    /// Echo generator with a custom delay.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl Default for EchoGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        let text = extract_code_block(prompt);
        if text.is_empty() {
            return Err(GenerationError::InvalidResponse("empty prompt".to_string()));
        }
        Ok(text)
    }
}

// ============================================================================
// OpenAI-compatible Generator
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Generator backed by an OpenAI-compatible chat completions endpoint.
///
/// ## Example
///
/// ```no_run
/// use tokio_evolve_orchestrator::OpenAiCompatibleGenerator;
///
/// # fn example() -> Result<(), tokio_evolve_orchestrator::ConfigError> {
/// let generator = OpenAiCompatibleGenerator::from_env(
///     "https://api.openai.com/v1",
///     "gpt-4o-mini",
///     "OPENAI_API_KEY",
/// )?;
/// # Ok(()) }
/// ```
pub struct OpenAiCompatibleGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatibleGenerator {
    /// Create a generator for `base_url` (e.g. `https://api.openai.com/v1`).
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Create a generator whose API key is read from `api_key_env`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] if the variable is unset, so a
    /// missing key surfaces at startup rather than at the first call.
    pub fn from_env(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key_env: &str,
    ) -> Result<Self, ConfigError> {
        let api_key = std::env::var(api_key_env).map_err(|_| ConfigError::InvalidField {
            field: "api_key_env".to_string(),
            value: api_key_env.to_string(),
            reason: "environment variable not set".to_string(),
        })?;
        Ok(Self::new(base_url, model, api_key))
    }

    /// Set the HTTP request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Generator for OpenAiCompatibleGenerator {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout
                } else {
                    GenerationError::Unavailable(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerationError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                GenerationError::Unavailable(format!("API error {status}: {body}"))
            } else {
                GenerationError::InvalidResponse(format!("API error {status}: {body}"))
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout
            } else {
                GenerationError::InvalidResponse(format!("unparsable body: {e}"))
            }
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let source = extract_code_block(&content);
        if source.is_empty() {
            return Err(GenerationError::InvalidResponse("empty completion".to_string()));
        }
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params() -> GenerationParams {
        GenerationParams {
            temperature: 0.5,
            max_tokens: 128,
        }
    }

    fn reply(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        })
    }

    #[test]
    fn test_extract_code_block_strips_fence_and_language() {
        let text = "Here you go:\n```python\ndef f():\n    return 1\n```\nDone.";
        assert_eq!(extract_code_block(text), "def f():\n    return 1");
    }

    #[test]
    fn test_extract_code_block_without_fence_returns_trimmed() {
        assert_eq!(extract_code_block("  x = 1\n"), "x = 1");
        assert_eq!(extract_code_block("```python\nunterminated"), "```python\nunterminated");
    }

    #[tokio::test]
    async fn test_echo_generator_returns_parent_block() {
        let gen = EchoGenerator::with_delay(0);
        let out = gen
            .generate("Improve:\n```\nprint(1)\n```\n", &params())
            .await
            .unwrap();
        assert_eq!(out, "print(1)");
    }

    #[tokio::test]
    async fn test_openai_generator_extracts_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("```rust\nfn main() {}\n```")))
            .expect(1)
            .mount(&server)
            .await;

        let gen = OpenAiCompatibleGenerator::new(format!("{}/v1", server.uri()), "m", "sk-test");
        let out = gen.generate("prompt", &params()).await.unwrap();
        assert_eq!(out, "fn main() {}");
    }

    #[tokio::test]
    async fn test_openai_generator_maps_429_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let gen = OpenAiCompatibleGenerator::new(server.uri(), "m", "k");
        let err = gen.generate("prompt", &params()).await.unwrap_err();
        assert_eq!(err, GenerationError::RateLimited);
    }

    #[tokio::test]
    async fn test_openai_generator_maps_500_to_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let gen = OpenAiCompatibleGenerator::new(server.uri(), "m", "k");
        let err = gen.generate("prompt", &params()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Unavailable(ref m) if m.contains("overloaded")));
    }

    #[tokio::test]
    async fn test_openai_generator_empty_reply_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("   ")))
            .mount(&server)
            .await;

        let gen = OpenAiCompatibleGenerator::new(server.uri(), "m", "k");
        let err = gen.generate("prompt", &params()).await.unwrap_err();
        assert!(matches!(err, GenerationError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_openai_generator_garbage_body_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let gen = OpenAiCompatibleGenerator::new(server.uri(), "m", "k");
        let err = gen.generate("prompt", &params()).await.unwrap_err();
        assert!(matches!(err, GenerationError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_openai_generator_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(reply("x"))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let gen = OpenAiCompatibleGenerator::new(server.uri(), "m", "k")
            .with_timeout(Duration::from_millis(50));
        let err = gen.generate("prompt", &params()).await.unwrap_err();
        assert_eq!(err, GenerationError::Timeout);
    }

    #[test]
    fn test_from_env_missing_key_is_config_error() {
        let err = OpenAiCompatibleGenerator::from_env(
            "http://localhost",
            "m",
            "EVOLVE_TEST_SURELY_UNSET_KEY",
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::InvalidField { .. }));
    }
}
