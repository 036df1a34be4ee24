//! Hierarchical context compression.
//!
//! Reduces any number of text fragments to a single string of at most
//! `max_tokens` tokens. When the joined fragments do not fit, the text is
//! cut into budget-sized chunks, each chunk is summarized by the service,
//! and the summaries become the next round's fragments. The loop is
//! bounded:
//!
//! 1. at most [`MAX_ROUNDS`] rounds;
//! 2. a round with no usable summary hard-truncates the current text;
//! 3. a round that yields a single summary no smaller than its input
//!    hard-truncates that summary and stops.
//!
//! Chunk failures are logged and skipped, so compression never fails and
//! the budget always holds.

use std::sync::Arc;

use crate::llm::{ChatMessage, LlmClient};

pub const MAX_ROUNDS: usize = 6;

const SEPARATOR: &str = "\n\n";

pub struct ContextCompressor {
    llm: Arc<LlmClient>,
    language: String,
}

impl ContextCompressor {
    pub fn new(llm: Arc<LlmClient>, language: impl Into<String>) -> Self {
        Self {
            llm,
            language: language.into(),
        }
    }

    pub async fn compress(
        &self,
        texts: &[String],
        max_tokens: usize,
        label: &str,
        focus: &str,
    ) -> String {
        let tokenizer = self.llm.tokenizer();
        let mut current: Vec<String> = texts
            .iter()
            .filter(|t| !t.trim().is_empty())
            .cloned()
            .collect();

        for round in 1..=MAX_ROUNDS {
            let joined = current.join(SEPARATOR);
            let joined_tokens = tokenizer.count(&joined);
            if joined_tokens <= max_tokens {
                return joined;
            }

            let chunks = tokenizer.split(&joined, max_tokens);
            let total = chunks.len();
            let mut summaries = Vec::with_capacity(total);
            for (idx, chunk) in chunks.into_iter().enumerate() {
                tracing::debug!(label, round, chunk = idx + 1, total, "compressing chunk");
                match self.summarize_chunk(chunk, focus).await {
                    Ok(text) if !text.is_empty() => summaries.push(text),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(label, round, "chunk compression failed: {}", e),
                }
            }

            if summaries.is_empty() {
                return tokenizer.truncate(&joined, max_tokens);
            }
            if summaries.len() == 1 && tokenizer.count(&summaries[0]) >= joined_tokens {
                tracing::debug!(label, round, "compression made no progress, truncating");
                return tokenizer.truncate(&summaries[0], max_tokens);
            }
            current = summaries;
        }

        tokenizer.truncate(&current.join(SEPARATOR), max_tokens)
    }

    async fn summarize_chunk(
        &self,
        chunk: String,
        focus: &str,
    ) -> Result<String, crate::error::LlmError> {
        let mut prompt = String::from(
            "Compress the following context into a short but informative digest. \
             Keep key entities, relationships, architectural decisions and important names. \
             Do not add facts of your own. ",
        );
        if !focus.is_empty() {
            prompt.push_str(&format!("Focus: {}. ", focus));
        }
        prompt.push_str(&format!("Language: {}.", self.language));

        let text = self
            .llm
            .chat(vec![ChatMessage::system(prompt), ChatMessage::user(chunk)])
            .await?;
        Ok(text.trim().to_string())
    }
}
