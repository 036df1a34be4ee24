//! Core data models used throughout doc-harness.
//!
//! These types represent the scanned files, the per-path records tracked
//! across runs, and the diff and error values that flow through the
//! summarization and rendering pipeline.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Coarse classification of an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Code,
    Docs,
    Config,
    Data,
    Infra,
    Ci,
    Other,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Code => "code",
            FileType::Docs => "docs",
            FileType::Config => "config",
            FileType::Data => "data",
            FileType::Infra => "infra",
            FileType::Ci => "ci",
            FileType::Other => "other",
        }
    }
}

/// Raw file produced by the scanner, before change detection.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Repository-relative, slash-separated path.
    pub path: String,
    pub content: String,
    pub size: u64,
    pub file_type: FileType,
    pub domains: BTreeSet<String>,
}

/// The three kinds of per-file summary artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    Summary,
    ModuleSummary,
    ConfigSummary,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::Summary,
        ArtifactKind::ModuleSummary,
        ArtifactKind::ConfigSummary,
    ];

    /// Subdirectory of the summary tree holding this kind.
    pub fn subdir(&self) -> &'static str {
        match self {
            ArtifactKind::Summary => "files",
            ArtifactKind::ModuleSummary => "modules",
            ArtifactKind::ConfigSummary => "configs",
        }
    }

    /// Stage label used in logs and error reports.
    pub fn stage(&self) -> &'static str {
        match self {
            ArtifactKind::Summary => "summarize",
            ArtifactKind::ModuleSummary => "summarize module",
            ArtifactKind::ConfigSummary => "summarize config",
        }
    }

    /// Module and config summaries follow a fixed structural grammar.
    pub fn is_detailed(&self) -> bool {
        !matches!(self, ArtifactKind::Summary)
    }
}

/// Tracked metadata for one input file.
///
/// The path is the key of the owning map. Raw content is never stored
/// here; it lives in a separate in-memory table for the current run only.
///
/// Artifact references are private: they are only changed through
/// [`set_artifact`](FileRecord::set_artifact) and
/// [`clear_artifact`](FileRecord::clear_artifact), which refuse kinds that
/// do not apply to the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub hash: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub file_type: FileType,
    #[serde(default)]
    pub domains: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    module_summary_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config_summary_path: Option<String>,
}

impl FileRecord {
    pub fn new(hash: String, size: u64, file_type: FileType, domains: BTreeSet<String>) -> Self {
        Self {
            hash,
            size,
            file_type,
            domains,
            summary_path: None,
            module_summary_path: None,
            config_summary_path: None,
        }
    }

    /// Whether an artifact of `kind` applies to the file at `path`.
    pub fn wants(&self, path: &str, kind: ArtifactKind) -> bool {
        match kind {
            ArtifactKind::Summary => true,
            ArtifactKind::ModuleSummary => self.file_type == FileType::Code && !is_test_path(path),
            ArtifactKind::ConfigSummary => self.file_type == FileType::Config,
        }
    }

    /// Artifact kinds that apply to the file at `path`.
    pub fn wanted_kinds(&self, path: &str) -> Vec<ArtifactKind> {
        ArtifactKind::ALL
            .into_iter()
            .filter(|kind| self.wants(path, *kind))
            .collect()
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Option<&str> {
        match kind {
            ArtifactKind::Summary => self.summary_path.as_deref(),
            ArtifactKind::ModuleSummary => self.module_summary_path.as_deref(),
            ArtifactKind::ConfigSummary => self.config_summary_path.as_deref(),
        }
    }

    /// All artifact references currently recorded.
    pub fn artifacts(&self) -> impl Iterator<Item = (ArtifactKind, &str)> {
        ArtifactKind::ALL
            .into_iter()
            .filter_map(move |kind| self.artifact(kind).map(|p| (kind, p)))
    }

    /// Record the stored location of an artifact.
    ///
    /// Fails when `kind` does not apply to this file (a config summary on
    /// a code file, a module summary on a test file).
    pub fn set_artifact(&mut self, path: &str, kind: ArtifactKind, location: String) -> Result<()> {
        if !self.wants(path, kind) {
            bail!(
                "{} does not apply to {} ({})",
                kind.stage(),
                path,
                self.file_type.as_str()
            );
        }
        *self.slot(kind) = Some(location);
        Ok(())
    }

    pub fn clear_artifact(&mut self, kind: ArtifactKind) {
        *self.slot(kind) = None;
    }

    fn slot(&mut self, kind: ArtifactKind) -> &mut Option<String> {
        match kind {
            ArtifactKind::Summary => &mut self.summary_path,
            ArtifactKind::ModuleSummary => &mut self.module_summary_path,
            ArtifactKind::ConfigSummary => &mut self.config_summary_path,
        }
    }
}

/// Names of the sections rebuilt by the last run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionLog {
    #[serde(default)]
    pub regenerated: Vec<String>,
}

/// The durable state persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
    #[serde(default)]
    pub sections: SectionLog,
}

/// Partition of the current and prior path universes.
///
/// `added`, `modified` and `unchanged` hold current records; `deleted`
/// holds the prior records (with their artifact references).
#[derive(Debug, Clone, Default)]
pub struct DiffPartition {
    pub added: BTreeMap<String, FileRecord>,
    pub modified: BTreeMap<String, FileRecord>,
    pub deleted: BTreeMap<String, FileRecord>,
    pub unchanged: BTreeMap<String, FileRecord>,
    /// Domain tags touched by any change, old and new tags alike.
    pub changed_domains: BTreeSet<String>,
    /// Prior record of every modified path.
    pub previous: BTreeMap<String, FileRecord>,
    /// Unchanged paths that received a new artifact during this run.
    pub refreshed: BTreeSet<String>,
}

impl DiffPartition {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty())
    }

    /// Whether any section input differs from the last run: a file changed
    /// or an unchanged file got a summary it was missing.
    pub fn inputs_changed(&self) -> bool {
        self.has_changes() || !self.refreshed.is_empty()
    }

    /// Record unchanged paths whose artifacts were rebuilt. Paths that are
    /// not unchanged are ignored; their domains count as changed.
    pub fn mark_refreshed<'a>(&mut self, paths: impl IntoIterator<Item = &'a String>) {
        for path in paths {
            if let Some(record) = self.unchanged.get(path) {
                self.changed_domains.extend(record.domains.iter().cloned());
                self.refreshed.insert(path.clone());
            }
        }
    }

    /// Changed paths with every record known for them (current and prior),
    /// refreshed paths included.
    pub fn changed_records(&self) -> impl Iterator<Item = (&String, &FileRecord)> {
        let refreshed = self
            .unchanged
            .iter()
            .filter(|(path, _)| self.refreshed.contains(*path));
        self.added
            .iter()
            .chain(self.modified.iter())
            .chain(self.previous.iter())
            .chain(self.deleted.iter())
            .chain(refreshed)
    }
}

/// A per-task failure, reported at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskError {
    pub path: String,
    pub stage: String,
    pub cause: String,
}

impl TaskError {
    pub fn new(path: impl Into<String>, stage: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            stage: stage.into(),
            cause: cause.into(),
        }
    }
}

/// Error list shared between concurrently running tasks.
#[derive(Debug, Default)]
pub struct ErrorLog {
    entries: Mutex<Vec<TaskError>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, error: TaskError) {
        tracing::warn!(path = %error.path, stage = %error.stage, "{}", error.cause);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<TaskError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Heuristic test-file detection on a repository-relative path.
pub fn is_test_path(path: &str) -> bool {
    let p = Path::new(path);
    if p.components().any(|c| {
        matches!(
            c.as_os_str().to_str(),
            Some("test") | Some("tests") | Some("__tests__")
        )
    }) {
        return true;
    }
    let name = p.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.starts_with("test_")
        || name.ends_with("_test.py")
        || name.ends_with("_test.rs")
        || name.ends_with("_test.go")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(file_type: FileType) -> FileRecord {
        FileRecord::new("h".into(), 1, file_type, BTreeSet::new())
    }

    #[test]
    fn test_path_detection() {
        assert!(is_test_path("tests/test_cache.py"));
        assert!(is_test_path("src/__tests__/app.js"));
        assert!(is_test_path("pkg/server_test.go"));
        assert!(is_test_path("test_main.py"));
        assert!(!is_test_path("src/testing.rs"));
        assert!(!is_test_path("src/contest/main.py"));
    }

    #[test]
    fn code_file_refuses_config_summary() {
        let mut rec = record(FileType::Code);
        assert!(rec
            .set_artifact("src/app.py", ArtifactKind::ConfigSummary, "x.md".into())
            .is_err());
        assert!(rec.artifact(ArtifactKind::ConfigSummary).is_none());
        rec.set_artifact("src/app.py", ArtifactKind::ModuleSummary, "m.md".into())
            .unwrap();
        assert_eq!(rec.artifact(ArtifactKind::ModuleSummary), Some("m.md"));
    }

    #[test]
    fn test_file_refuses_module_summary() {
        let mut rec = record(FileType::Code);
        assert!(rec
            .set_artifact("tests/test_app.py", ArtifactKind::ModuleSummary, "m.md".into())
            .is_err());
        assert_eq!(
            rec.wanted_kinds("tests/test_app.py"),
            vec![ArtifactKind::Summary]
        );
    }

    #[test]
    fn config_file_wants_config_summary() {
        let rec = record(FileType::Config);
        assert_eq!(
            rec.wanted_kinds("deploy/values.yaml"),
            vec![ArtifactKind::Summary, ArtifactKind::ConfigSummary]
        );
    }

    #[test]
    fn record_serializes_without_empty_artifacts() {
        let mut rec = record(FileType::Config);
        rec.set_artifact("a.toml", ArtifactKind::Summary, "files/a_toml.md".into())
            .unwrap();
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["type"], "config");
        assert_eq!(json["summary_path"], "files/a_toml.md");
        assert!(json.get("module_summary_path").is_none());
        let back: FileRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn error_log_collects() {
        let log = ErrorLog::new();
        assert!(log.is_empty());
        log.push(TaskError::new("a.py", "summarize", "boom"));
        assert_eq!(log.len(), 1);
        assert_eq!(log.snapshot()[0].cause, "boom");
    }

    #[test]
    fn refreshed_unchanged_path_counts_as_input_change() {
        let mut tagged = record(FileType::Infra);
        tagged.domains.insert("docker".into());
        let mut diff = DiffPartition::default();
        diff.unchanged.insert("Dockerfile".into(), tagged);
        diff.unchanged.insert("a.py".into(), record(FileType::Code));
        assert!(!diff.inputs_changed());
        assert_eq!(diff.changed_records().count(), 0);

        diff.mark_refreshed(&["Dockerfile".to_string(), "gone.py".to_string()]);
        assert!(!diff.has_changes());
        assert!(diff.inputs_changed());
        assert!(diff.changed_domains.contains("docker"));
        let paths: Vec<&String> = diff.changed_records().map(|(path, _)| path).collect();
        assert_eq!(paths, vec!["Dockerfile"]);
    }
}
