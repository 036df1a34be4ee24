//! Token counting and token-boundary splitting.
//!
//! Two implementations sit behind the [`Tokenizer`] trait:
//! - **[`BpeTokenizer`]**: the model's BPE vocabulary via `tiktoken-rs`,
//!   falling back to `cl100k_base` for unknown model names.
//! - **[`ByteTokenizer`]**: one token per UTF-8 byte. Deterministic and
//!   dependency-free; used in tests and as a conservative fallback.
//!
//! `truncate` always returns text counting at most `max_tokens`. `split`
//! cuts on the tokens of the original encoding; a piece re-encoded on its
//! own may differ by a token at its edges for BPE vocabularies.

use anyhow::{bail, Result};
use std::sync::Arc;
use tiktoken_rs::CoreBPE;

pub trait Tokenizer: Send + Sync {
    /// Number of tokens in `text`.
    fn count(&self, text: &str) -> usize;

    /// Split `text` into consecutive pieces of at most `max_tokens` tokens.
    /// Joining the pieces gives back the input (modulo undecodable bytes).
    fn split(&self, text: &str, max_tokens: usize) -> Vec<String>;

    /// Longest prefix of `text` that fits in `max_tokens`.
    fn truncate(&self, text: &str, max_tokens: usize) -> String;
}

/// Build the tokenizer named in config (`"tiktoken"` or `"bytes"`).
pub fn for_model(kind: &str, model: &str) -> Result<Arc<dyn Tokenizer>> {
    match kind {
        "tiktoken" => Ok(Arc::new(BpeTokenizer::for_model(model)?)),
        "bytes" => Ok(Arc::new(ByteTokenizer)),
        other => bail!("Unknown tokenizer: '{}'. Must be tiktoken or bytes.", other),
    }
}

// ============ Byte Tokenizer ============

/// Counts UTF-8 bytes; splits only on character boundaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    /// Largest char boundary `<= start + max` (and `> start` when possible).
    fn boundary(text: &str, start: usize, max: usize) -> usize {
        let mut end = (start + max).min(text.len());
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        end
    }
}

impl Tokenizer for ByteTokenizer {
    fn count(&self, text: &str) -> usize {
        text.len()
    }

    fn split(&self, text: &str, max_tokens: usize) -> Vec<String> {
        if max_tokens == 0 || text.is_empty() {
            return Vec::new();
        }
        let mut pieces = Vec::new();
        let mut start = 0;
        while start < text.len() {
            let mut end = Self::boundary(text, start, max_tokens);
            if end == start {
                // A single character wider than the budget: skip it.
                end = start + text[start..].chars().next().map_or(1, char::len_utf8);
                start = end;
                continue;
            }
            pieces.push(text[start..end].to_string());
            start = end;
        }
        pieces
    }

    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        let end = Self::boundary(text, 0, max_tokens);
        text[..end].to_string()
    }
}

// ============ BPE Tokenizer ============

/// Tokenizer backed by an OpenAI BPE vocabulary.
pub struct BpeTokenizer {
    bpe: CoreBPE,
}

impl BpeTokenizer {
    pub fn for_model(model: &str) -> Result<Self> {
        let bpe = match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => bpe,
            Err(_) => {
                tracing::debug!(model, "no BPE vocabulary for model, using cl100k_base");
                tiktoken_rs::cl100k_base()?
            }
        };
        Ok(Self { bpe })
    }
}

impl Tokenizer for BpeTokenizer {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn split(&self, text: &str, max_tokens: usize) -> Vec<String> {
        if max_tokens == 0 || text.is_empty() {
            return Vec::new();
        }
        let tokens = self.bpe.encode_with_special_tokens(text);
        let mut pieces = Vec::new();
        let mut start = 0;
        while start < tokens.len() {
            // Shrink the window until it decodes to valid UTF-8.
            let mut end = (start + max_tokens).min(tokens.len());
            let mut piece = None;
            while end > start {
                if let Ok(text) = self.bpe.decode(tokens[start..end].to_vec()) {
                    piece = Some(text);
                    break;
                }
                end -= 1;
            }
            match piece {
                Some(text) => {
                    pieces.push(text);
                    start = end;
                }
                // Undecodable fragment: drop one token and move on.
                None => start += 1,
            }
        }
        pieces
    }

    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if max_tokens == 0 {
            return String::new();
        }
        let tokens = self.bpe.encode_with_special_tokens(text);
        if tokens.len() <= max_tokens {
            return text.to_string();
        }
        let mut end = max_tokens;
        while end > 0 {
            if let Ok(candidate) = self.bpe.decode(tokens[..end].to_vec()) {
                // Re-encoding a decoded prefix may merge differently; verify.
                if self.count(&candidate) <= max_tokens {
                    return candidate;
                }
            }
            end -= 1;
        }
        String::new()
    }
}
