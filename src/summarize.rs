//! Per-file summarization requests.
//!
//! Three artifact kinds are produced:
//!
//! - **summary**: short prose for any file;
//! - **module summary**: a doxygen-like outline of a source file;
//! - **config summary**: the sections and keys of a configuration file.
//!
//! Content larger than the per-request budget is split into sequential
//! chunks that are summarized independently and merged by one more
//! request. Detailed kinds that come back free-form (headings, lists,
//! code fences, filler phrases) get one reformatting pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::LlmError;
use crate::llm::{ChatMessage, LlmClient};
use crate::models::{ArtifactKind, FileType};

/// Returned without a request for files with no content.
pub const EMPTY_FILE_NOTE: &str = "Empty file.";

const SUMMARY_PROMPT: &str = "You are an expert technical writer. Write a short but informative \
description of this file for inclusion in project documentation. State its purpose, key \
entities and important settings. For configuration files list the key parameters and \
sections. Answer in Markdown without a heading.";

const MODULE_PROMPT: &str = "You document source code. Describe this file using only the \
following plain-text grammar, one tag per line:\n\
@brief <one or two sentences on the module's purpose>\n\
@structures <optional: key data structures, one per line as `Name: description`>\n\
Then one block per public function or class:\n\
@function <name>(<signature>)\n\
@param <name> <description>\n\
@return <description>\n\
@throws <error and condition>\n\
or\n\
@class <name>\n\
@field <name> <description>\n\
@method <name>(<signature>) <description>\n\
Leave a blank line between blocks. No Markdown headings, lists or code fences.";

const CONFIG_PROMPT: &str = "You document configuration files. Describe this file using only \
the following plain-text grammar:\n\
@brief <one or two sentences on what the file configures>\n\
@sections\n\
<section>: <key>, <key>, ...\n\
@important <optional: parameters that change behaviour, one per line as `key: effect`>\n\
No Markdown headings, lists or code fences.";

const MERGE_PROMPT: &str = "Merge the partial descriptions below into a single concise \
description of the whole file for project documentation. Answer in Markdown.";

const REFORMAT_PROMPT: &str = "Rewrite the text below so that it strictly follows the grammar \
described here, dropping any headings, list markers, code fences and introductory phrases. \
Keep every fact.";

const NOISE_PHRASES: [&str; 3] = ["here is", "below is", "in summary"];

/// Whether a detailed summary drifted away from the tag grammar.
pub fn needs_reformat(text: &str) -> bool {
    let lower = text.to_lowercase();
    if NOISE_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    text.lines().any(|line| {
        let line = line.trim_start();
        line.starts_with("```")
            || line.starts_with('#')
            || line.starts_with("- ")
            || line.starts_with("* ")
            || line.starts_with("+ ")
            || is_numbered_item(line)
    })
}

fn is_numbered_item(line: &str) -> bool {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0 && (line[digits..].starts_with(". ") || line[digits..].starts_with(") "))
}

pub struct Summarizer {
    llm: Arc<LlmClient>,
    language: String,
    chunk_tokens: usize,
}

impl Summarizer {
    pub fn new(llm: Arc<LlmClient>, language: impl Into<String>, chunk_tokens: usize) -> Self {
        Self {
            llm,
            language: language.into(),
            chunk_tokens: chunk_tokens.max(1),
        }
    }

    pub async fn summarize(
        &self,
        content: &str,
        kind: ArtifactKind,
        file_type: FileType,
        domains: &BTreeSet<String>,
    ) -> Result<String, LlmError> {
        if content.trim().is_empty() {
            return Ok(EMPTY_FILE_NOTE.to_string());
        }

        let system = self.system_prompt(kind, file_type, domains);
        let chunks = self.llm.tokenizer().split(content, self.chunk_tokens);
        let mut parts = Vec::with_capacity(chunks.len());
        for (idx, chunk) in chunks.into_iter().enumerate() {
            tracing::debug!(stage = kind.stage(), chunk = idx + 1, "summarizing chunk");
            let text = self
                .llm
                .chat(vec![ChatMessage::system(system.clone()), ChatMessage::user(chunk)])
                .await?;
            parts.push(text.trim().to_string());
        }

        let mut summary = if parts.len() == 1 {
            parts.remove(0)
        } else {
            self.merge(&parts, kind).await?
        };

        if kind.is_detailed() && needs_reformat(&summary) {
            tracing::debug!(stage = kind.stage(), "reformatting free-form summary");
            summary = self.reformat(&summary, kind).await?;
        }
        Ok(summary)
    }

    fn grammar(kind: ArtifactKind) -> Option<&'static str> {
        match kind {
            ArtifactKind::Summary => None,
            ArtifactKind::ModuleSummary => Some(MODULE_PROMPT),
            ArtifactKind::ConfigSummary => Some(CONFIG_PROMPT),
        }
    }

    fn system_prompt(&self, kind: ArtifactKind, file_type: FileType, domains: &BTreeSet<String>) -> String {
        let mut prompt = Self::grammar(kind).unwrap_or(SUMMARY_PROMPT).to_string();
        if kind == ArtifactKind::Summary && (file_type == FileType::Infra || !domains.is_empty()) {
            let tags: Vec<&str> = domains.iter().map(String::as_str).collect();
            prompt.push_str(&format!(
                "\nThe file belongs to the infrastructure: {}.",
                tags.join(", ")
            ));
        }
        prompt.push_str(&format!("\nLanguage: {}.", self.language));
        prompt
    }

    async fn merge(&self, parts: &[String], kind: ArtifactKind) -> Result<String, LlmError> {
        let mut prompt = MERGE_PROMPT.to_string();
        if let Some(grammar) = Self::grammar(kind) {
            prompt = format!("{}\n\n{}", MERGE_PROMPT.replace(" Answer in Markdown.", ""), grammar);
        }
        prompt.push_str(&format!("\nLanguage: {}.", self.language));
        let text = self
            .llm
            .chat(vec![ChatMessage::system(prompt), ChatMessage::user(parts.join("\n\n"))])
            .await?;
        Ok(text.trim().to_string())
    }

    async fn reformat(&self, text: &str, kind: ArtifactKind) -> Result<String, LlmError> {
        let grammar = Self::grammar(kind).unwrap_or_default();
        let prompt = format!("{}\n\n{}\nLanguage: {}.", REFORMAT_PROMPT, grammar, self.language);
        let text = self
            .llm
            .chat(vec![ChatMessage::system(prompt), ChatMessage::user(text)])
            .await?;
        Ok(text.trim().to_string())
    }
}
