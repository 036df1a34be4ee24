#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use doc_harness::config::Config;
use doc_harness::error::LlmError;
use doc_harness::llm::{ChatRequest, Role, TextGenerator};
use doc_harness::pipeline::{GenerateOptions, OutputPaths, Pipeline, RunReport};
use doc_harness::policy::ForceSet;
use doc_harness::scanner::scan_repository;
use doc_harness::tokenizer::ByteTokenizer;

/// Deterministic in-process generator. The reply depends only on the
/// request's user text, so identical requests get identical replies.
#[derive(Default)]
pub struct MockGenerator {
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    fail_marker: Option<String>,
}

impl MockGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails every request whose user text contains `marker` with HTTP 503.
    pub fn failing_on(marker: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_marker: Some(marker.to_string()),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests whose user text contains `needle`.
    pub fn calls_containing(&self, needle: &str) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|text| text.contains(needle))
            .count()
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(&self, request: &ChatRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let user: String = request
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.seen.lock().unwrap().push(user.clone());

        if let Some(marker) = &self.fail_marker {
            if user.contains(marker.as_str()) {
                return Err(LlmError::Server {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
        }

        let head: String = user
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == ' ')
            .take(32)
            .collect();
        Ok(format!("Text of {} bytes about {}.", user.len(), head.trim()))
    }
}

/// Defaults with a byte tokenizer and millisecond backoff.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.llm.tokenizer = "bytes".into();
    config.llm.retry.base_delay_ms = 1;
    config.llm.retry.max_delay_ms = 2;
    config
}

pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

pub async fn generate(
    root: &Path,
    config: &Config,
    generator: Arc<MockGenerator>,
    regen: &[&str],
) -> RunReport {
    let paths = OutputPaths::resolve(&config.output, root);
    let files = scan_repository(root, &config.scan, &paths.scan_excludes(root)).unwrap();
    let options = GenerateOptions {
        force: ForceSet::parse(regen),
        project_name: "demo".into(),
        ..GenerateOptions::default()
    };
    Pipeline::new(config.clone(), root, generator, Arc::new(ByteTokenizer))
        .run(files, &options)
        .await
        .unwrap()
}

/// Every file under `dir`, keyed by relative path.
pub fn read_tree(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(dir)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            out.insert(rel, fs::read(entry.path()).unwrap());
        }
    }
    out
}
