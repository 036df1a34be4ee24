//! Error taxonomy for calls to the text-generation service.
//!
//! Everything else in the crate uses `anyhow`; service failures get a
//! dedicated enum because the retry loop has to tell transient failures
//! apart from permanent ones.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited (HTTP 429): {0}")]
    RateLimited(String),

    #[error("server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    #[error("request rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("empty response")]
    EmptyResponse,

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<LlmError> },
}

impl LlmError {
    /// Timeouts, rate limits, 5xx responses and transport failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout(_)
                | LlmError::RateLimited(_)
                | LlmError::Server { .. }
                | LlmError::Transport(_)
        )
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => LlmError::RateLimited(body),
            500..=599 => LlmError::Server { status, body },
            _ => LlmError::Rejected { status, body },
        }
    }
}
