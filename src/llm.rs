//! Client for the remote text-generation service.
//!
//! [`TextGenerator`] is the transport seam: one request in, one text out.
//! [`OpenAiGenerator`] implements it against any OpenAI-compatible
//! `POST {base_url}/chat/completions` endpoint. Tests substitute scripted
//! generators.
//!
//! [`LlmClient`] wraps a generator with the response cache and the retry
//! policy:
//!
//! | Failure | Handling |
//! |---------|----------|
//! | timeout, HTTP 429, HTTP 5xx, transport error | retried with exponential backoff and jitter |
//! | other HTTP 4xx, malformed or empty response | fails immediately |
//! | retryable failure on the last attempt | [`LlmError::RetriesExhausted`] |
//!
//! Each attempt runs under its own timeout, stretched between a floor and
//! a ceiling by the estimated size of the input.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, LlmConfig, RetryConfig};
use crate::error::LlmError;
use crate::response_cache::{request_key, ResponseCache};
use crate::tokenizer::Tokenizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A complete chat-completion request. Its JSON form is both the HTTP
/// body and the response-cache key material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &ChatRequest) -> Result<String, LlmError>;
}

// ============ OpenAI-compatible Generator ============

pub struct OpenAiGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiGenerator {
    pub fn new(base_url: &str, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    /// Build from config, reading the key from `llm.api_key_env`.
    ///
    /// # Errors
    ///
    /// Fails when the key variable is unset or empty.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("{} environment variable not set", config.api_key_env),
        };
        Self::new(&config.base_url, api_key)
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), body));
        }

        let json: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| LlmError::Malformed(e.to_string()))?;
        parse_chat_response(&json)
    }
}

/// Extract `choices[0].message.content`.
fn parse_chat_response(json: &serde_json::Value) -> Result<String, LlmError> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| LlmError::Malformed("missing choices[0].message.content".into()))
}

// ============ Retry Policy ============

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub timeout_floor: Duration,
    pub timeout_ceiling: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_factor: config.jitter_factor,
            timeout_floor: Duration::from_secs(config.timeout_floor_secs),
            timeout_ceiling: Duration::from_secs(config.timeout_ceiling_secs),
        }
    }

    /// Delay before retry number `attempt` (1-based): exponential, capped,
    /// then spread by up to `jitter_factor` in either direction.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter_factor;
        delay.mul_f64((1.0 + spread).max(0.0))
    }

    /// Per-attempt timeout, interpolated by `input_tokens / context_limit`.
    pub fn attempt_timeout(&self, input_tokens: usize, context_limit: usize) -> Duration {
        let ratio = if context_limit == 0 {
            1.0
        } else {
            (input_tokens as f64 / context_limit as f64).min(1.0)
        };
        let span = self.timeout_ceiling.saturating_sub(self.timeout_floor);
        self.timeout_floor + span.mul_f64(ratio)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

// ============ Client ============

/// Request parameters shared by every call.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub context_limit: usize,
}

impl LlmSettings {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            context_limit: config.context_tokens,
        }
    }
}

pub struct LlmClient {
    generator: Arc<dyn TextGenerator>,
    cache: Option<Arc<ResponseCache>>,
    tokenizer: Arc<dyn Tokenizer>,
    settings: LlmSettings,
    retry: RetryPolicy,
    remote_calls: AtomicU64,
}

impl LlmClient {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        tokenizer: Arc<dyn Tokenizer>,
        settings: LlmSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            generator,
            cache: None,
            tokenizer,
            settings,
            retry,
            remote_calls: AtomicU64::new(0),
        }
    }

    pub fn from_config(
        config: &Config,
        generator: Arc<dyn TextGenerator>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        Self::new(
            generator,
            tokenizer,
            LlmSettings::from_config(&config.llm),
            RetryPolicy::from_config(&config.llm.retry),
        )
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    /// Attempts sent to the generator so far, retries included.
    pub fn remote_calls(&self) -> u64 {
        self.remote_calls.load(Ordering::Relaxed)
    }

    /// Send `messages`, serving from the cache when possible.
    ///
    /// The returned text is non-empty but otherwise as the service sent it.
    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };

        let key = self.cache.as_ref().map(|_| request_key(&request));
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(hit) = cache.get(key) {
                return Ok(hit);
            }
        }

        let input_tokens: usize = request
            .messages
            .iter()
            .map(|m| self.tokenizer.count(&m.content))
            .sum();
        let timeout = self
            .retry
            .attempt_timeout(input_tokens, self.settings.context_limit);
        let text = self.send_with_retry(&request, timeout).await?;

        if let (Some(cache), Some(key)) = (&self.cache, key) {
            cache.put(key, text.clone());
        }
        Ok(text)
    }

    async fn send_with_retry(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.remote_calls.fetch_add(1, Ordering::Relaxed);

            let result = match tokio::time::timeout(timeout, self.generator.generate(request)).await
            {
                Ok(Ok(text)) if text.trim().is_empty() => Err(LlmError::EmptyResponse),
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout(timeout)),
            };

            let err = match result {
                Ok(text) => return Ok(text),
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.retry.max_attempts {
                return Err(LlmError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.retry.backoff(attempt);
            tracing::debug!(attempt, ?delay, "retrying request: {}", err);
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::ByteTokenizer;
    use std::sync::Mutex;

    /// Replays a fixed list of outcomes, then repeats the last one.
    struct Scripted {
        outcomes: Mutex<Vec<Result<String, LlmError>>>,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<Result<String, LlmError>>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, _request: &ChatRequest) -> Result<String, LlmError> {
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.len() > 1 {
                return outcomes.pop().unwrap();
            }
            match outcomes.last().unwrap() {
                Ok(text) => Ok(text.clone()),
                Err(_) => Err(LlmError::Server {
                    status: 503,
                    body: "down".into(),
                }),
            }
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_factor: 0.0,
            timeout_floor: Duration::from_secs(5),
            timeout_ceiling: Duration::from_secs(5),
        }
    }

    fn client(generator: Scripted, max_attempts: u32) -> LlmClient {
        LlmClient::new(
            Arc::new(generator),
            Arc::new(ByteTokenizer),
            LlmSettings {
                model: "test".into(),
                temperature: 0.0,
                max_tokens: 64,
                context_limit: 1024,
            },
            fast_retry(max_attempts),
        )
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter_factor: 0.0,
            ..fast_retry(5)
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(30), Duration::from_millis(350));
    }

    #[test]
    fn backoff_jitter_stays_in_band() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(1000),
            jitter_factor: 0.2,
            ..fast_retry(5)
        };
        for _ in 0..50 {
            let d = policy.backoff(1);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn timeout_interpolates() {
        let policy = RetryPolicy {
            timeout_floor: Duration::from_secs(60),
            timeout_ceiling: Duration::from_secs(600),
            ..fast_retry(1)
        };
        assert_eq!(policy.attempt_timeout(0, 8192), Duration::from_secs(60));
        assert_eq!(policy.attempt_timeout(4096, 8192), Duration::from_secs(330));
        assert_eq!(policy.attempt_timeout(100_000, 8192), Duration::from_secs(600));
    }

    #[test]
    fn parses_chat_response() {
        let json = serde_json::json!({"choices": [{"message": {"role": "assistant", "content": "hi"}}]});
        assert_eq!(parse_chat_response(&json).unwrap(), "hi");
        let bad = serde_json::json!({"choices": []});
        assert!(matches!(parse_chat_response(&bad), Err(LlmError::Malformed(_))));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let llm = client(
            Scripted::new(vec![
                Err(LlmError::RateLimited("slow down".into())),
                Err(LlmError::Transport("reset".into())),
                Ok("done".into()),
            ]),
            5,
        );
        assert_eq!(llm.chat(vec![ChatMessage::user("x")]).await.unwrap(), "done");
        assert_eq!(llm.remote_calls(), 3);
    }

    #[tokio::test]
    async fn exhausts_attempt_ceiling() {
        let llm = client(
            Scripted::new(vec![Err(LlmError::Server {
                status: 500,
                body: String::new(),
            })]),
            3,
        );
        let err = llm.chat(vec![ChatMessage::user("x")]).await.unwrap_err();
        assert!(matches!(err, LlmError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(llm.remote_calls(), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let llm = client(
            Scripted::new(vec![
                Err(LlmError::Rejected {
                    status: 400,
                    body: "bad".into(),
                }),
                Ok("never".into()),
            ]),
            5,
        );
        let err = llm.chat(vec![ChatMessage::user("x")]).await.unwrap_err();
        assert!(matches!(err, LlmError::Rejected { status: 400, .. }));
        assert_eq!(llm.remote_calls(), 1);
    }

    #[tokio::test]
    async fn empty_response_is_permanent() {
        let llm = client(Scripted::new(vec![Ok("   ".into()), Ok("late".into())]), 5);
        let err = llm.chat(vec![ChatMessage::user("x")]).await.unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse));
        assert_eq!(llm.remote_calls(), 1);
    }

    #[tokio::test]
    async fn cache_hit_skips_generator() {
        let cache = Arc::new(ResponseCache::in_memory());
        let llm = client(Scripted::new(vec![Ok("answer".into())]), 1).with_cache(cache.clone());
        let first = llm.chat(vec![ChatMessage::user("q")]).await.unwrap();
        let second = llm.chat(vec![ChatMessage::user("q")]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(llm.remote_calls(), 1);
        assert_eq!(cache.len(), 1);
    }
}
