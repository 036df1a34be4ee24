//! Configuration loading and validation.
//!
//! doc-harness reads a TOML file made of these optional tables:
//!
//! ```toml
//! [llm]          # model, base_url, tokenizer, token limits
//! [llm.retry]    # attempts, backoff, jitter, timeouts
//! [generation]   # language, threads, small-repository threshold, paging
//! [scan]         # include/exclude globs, size limit, .gitignore
//! [output]       # docs and cache directories, response cache
//! [titles]       # section and domain titles
//! ```
//!
//! Every field has a default, so an empty file (or no file at all) is a
//! valid configuration. `OPENAI_BASE_URL` and `OPENAI_MODEL` override the
//! file; [`Config::validate`] rejects out-of-range values before a run.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "doc-harness.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub output: OutputConfig,
    /// Title overrides keyed by section or domain key.
    #[serde(default)]
    pub titles: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_context_tokens")]
    pub context_tokens: usize,
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            context_tokens: default_context_tokens(),
            tokenizer: default_tokenizer(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    1200
}
fn default_context_tokens() -> usize {
    8192
}
fn default_tokenizer() -> String {
    "tiktoken".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    #[serde(default = "default_timeout_floor_secs")]
    pub timeout_floor_secs: u64,
    #[serde(default = "default_timeout_ceiling_secs")]
    pub timeout_ceiling_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            timeout_floor_secs: default_timeout_floor_secs(),
            timeout_ceiling_secs: default_timeout_ceiling_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    32_000
}
fn default_jitter_factor() -> f64 {
    0.2
}
fn default_timeout_floor_secs() -> u64 {
    60
}
fn default_timeout_ceiling_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_language")]
    pub language: String,
    /// Concurrent file summarization tasks.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Concurrent section rendering tasks (capped at 4).
    #[serde(default = "default_section_threads")]
    pub section_threads: usize,
    /// Repositories with fewer non-test code files (but at least one) are
    /// rebuilt in full. `0` disables the override.
    #[serde(default = "default_regen_all_threshold")]
    pub regen_all_threshold: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Per-request token budget for file content.
    #[serde(default = "default_summary_chunk_tokens")]
    pub summary_chunk_tokens: usize,
    /// Response cache is flushed after this many completed summaries.
    #[serde(default = "default_cache_flush_every")]
    pub cache_flush_every: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            threads: default_threads(),
            section_threads: default_section_threads(),
            regen_all_threshold: default_regen_all_threshold(),
            page_size: default_page_size(),
            summary_chunk_tokens: default_summary_chunk_tokens(),
            cache_flush_every: default_cache_flush_every(),
        }
    }
}

fn default_language() -> String {
    "en".to_string()
}
fn default_threads() -> usize {
    4
}
fn default_section_threads() -> usize {
    4
}
fn default_regen_all_threshold() -> usize {
    50
}
fn default_page_size() -> usize {
    100
}
fn default_summary_chunk_tokens() -> usize {
    1800
}
fn default_cache_flush_every() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Skip files matched by the repository's `.gitignore` files.
    #[serde(default = "default_respect_gitignore")]
    pub respect_gitignore: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
            follow_symlinks: false,
            respect_gitignore: default_respect_gitignore(),
        }
    }
}

fn default_respect_gitignore() -> bool {
    true
}

fn default_include_globs() -> Vec<String> {
    [
        "**/*.{py,pyi,pyx,js,jsx,ts,tsx,go,java,c,cc,cpp,h,hpp,rs,rb,php,cs,kt,kts,swift,m,mm}",
        "**/*.{md,rst,adoc,txt}",
        "**/*.{yml,yaml,json,toml,ini,cfg,conf,env,properties}",
        "**/*.{tf,tfvars}",
        "**/Dockerfile*",
        "**/Jenkinsfile",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_max_file_bytes() -> u64 {
    200_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// Generated pages, relative to the output root.
    #[serde(default = "default_docs_dir")]
    pub docs_dir: PathBuf,
    /// Ledger, response cache and intermediate summaries.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            docs_dir: default_docs_dir(),
            cache_dir: default_cache_dir(),
            use_cache: default_use_cache(),
        }
    }
}

fn default_docs_dir() -> PathBuf {
    PathBuf::from(".ai-docs")
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from(".doc-harness-cache")
}
fn default_use_cache() -> bool {
    true
}

impl Config {
    /// Input token budget left for context once the completion is reserved.
    pub fn input_budget(&self) -> usize {
        self.llm
            .context_tokens
            .saturating_sub(self.llm.max_tokens as usize + 200)
            .max(512)
    }

    /// Apply `OPENAI_BASE_URL` / `OPENAI_MODEL` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            let url = url.trim();
            if !url.is_empty() {
                self.llm.base_url = url.to_string();
            }
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            let model = model.trim();
            if !model.is_empty() {
                self.llm.model = model.to_string();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.llm.max_tokens == 0 {
            anyhow::bail!("llm.max_tokens must be > 0");
        }
        if self.llm.context_tokens <= self.llm.max_tokens as usize {
            anyhow::bail!("llm.context_tokens must exceed llm.max_tokens");
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
        }
        match self.llm.tokenizer.as_str() {
            "tiktoken" | "bytes" => {}
            other => anyhow::bail!(
                "Unknown tokenizer: '{}'. Must be tiktoken or bytes.",
                other
            ),
        }

        let retry = &self.llm.retry;
        if retry.max_attempts == 0 {
            anyhow::bail!("llm.retry.max_attempts must be >= 1");
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            anyhow::bail!("llm.retry.jitter_factor must be in [0.0, 1.0]");
        }
        if retry.timeout_floor_secs == 0 || retry.timeout_ceiling_secs < retry.timeout_floor_secs {
            anyhow::bail!("llm.retry timeouts must satisfy 0 < floor <= ceiling");
        }

        let gen = &self.generation;
        if gen.threads == 0 || gen.section_threads == 0 {
            anyhow::bail!("generation.threads and generation.section_threads must be >= 1");
        }
        if gen.page_size == 0 {
            anyhow::bail!("generation.page_size must be >= 1");
        }
        if gen.summary_chunk_tokens == 0 {
            anyhow::bail!("generation.summary_chunk_tokens must be > 0");
        }
        if gen.cache_flush_every == 0 {
            anyhow::bail!("generation.cache_flush_every must be >= 1");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.apply_env();
    config.validate()?;
    Ok(config)
}

/// Load `path` when given, else `doc-harness.toml` if present, else defaults.
pub fn resolve_config(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        return load_config(path);
    }
    let fallback = Path::new(DEFAULT_CONFIG_FILE);
    if fallback.exists() {
        return load_config(fallback);
    }
    let mut config = Config::default();
    config.apply_env();
    config.validate()?;
    Ok(config)
}
