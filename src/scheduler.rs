//! Summarization scheduler.
//!
//! Turns the diff into a work list, runs the work under a bounded number
//! of concurrent tasks, and reclaims summaries nothing refers to anymore.
//!
//! # Ownership
//!
//! Tasks only compute text. The coordinating loop in [`Scheduler::run`]
//! is the single writer of the record map: it stores each artifact, sets
//! the reference on the owning record and checkpoints. A task failure is
//! logged to the shared [`ErrorLog`] and never cancels its siblings.
//!
//! # Carry-over
//!
//! Unchanged files keep their recorded artifacts as long as the files
//! still exist in the store; a missing artifact is scheduled again as if
//! the file had changed.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::artifacts::ArtifactStore;
use crate::models::{ArtifactKind, DiffPartition, ErrorLog, FileRecord, FileType, TaskError};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::summarize::Summarizer;

/// One artifact to produce for one file.
#[derive(Debug, Clone)]
pub struct SummaryJob {
    pub path: String,
    pub kind: ArtifactKind,
    pub content: Arc<str>,
    pub file_type: FileType,
    pub domains: BTreeSet<String>,
}

/// Build the work list and drop dangling references from `files`.
///
/// Added and modified files get every applicable kind. Unchanged files
/// get only the kinds whose recorded artifact is absent from the store.
pub fn plan_work(
    diff: &DiffPartition,
    files: &mut BTreeMap<String, FileRecord>,
    contents: &HashMap<String, Arc<str>>,
    store: &ArtifactStore,
) -> Vec<SummaryJob> {
    let mut jobs = Vec::new();
    for (path, record) in files.iter_mut() {
        let Some(content) = contents.get(path) else {
            tracing::warn!(path = %path, "no content for tracked file, skipping");
            continue;
        };
        let changed = diff.added.contains_key(path) || diff.modified.contains_key(path);

        for kind in ArtifactKind::ALL {
            if !record.wants(path, kind) {
                record.clear_artifact(kind);
                continue;
            }
            if !changed {
                if let Some(location) = record.artifact(kind) {
                    if store.summary_exists(location) {
                        continue;
                    }
                    tracing::info!(path = %path, stage = kind.stage(), "artifact missing, rescheduling");
                }
            }
            record.clear_artifact(kind);
            jobs.push(SummaryJob {
                path: path.clone(),
                kind,
                content: content.clone(),
                file_type: record.file_type,
                domains: record.domains.clone(),
            });
        }
    }
    jobs
}

/// What one [`Scheduler::run`] stored.
#[derive(Debug, Default)]
pub struct StoredArtifacts {
    pub count: usize,
    /// Paths that received at least one new artifact.
    pub paths: BTreeSet<String>,
}

pub struct Scheduler {
    summarizer: Arc<Summarizer>,
    store: ArtifactStore,
    concurrency: usize,
    errors: Arc<ErrorLog>,
    progress: Arc<dyn ProgressReporter>,
}

impl Scheduler {
    pub fn new(
        summarizer: Arc<Summarizer>,
        store: ArtifactStore,
        concurrency: usize,
        errors: Arc<ErrorLog>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            summarizer,
            store,
            concurrency: concurrency.max(1),
            errors,
            progress,
        }
    }

    /// Run every job; returns how many artifacts were stored and for which paths.
    ///
    /// `checkpoint` is called after each stored artifact with the updated
    /// map and the running count. Its errors are fatal.
    pub async fn run<F>(
        &self,
        jobs: Vec<SummaryJob>,
        files: &mut BTreeMap<String, FileRecord>,
        mut checkpoint: F,
    ) -> Result<StoredArtifacts>
    where
        F: FnMut(&BTreeMap<String, FileRecord>, usize) -> Result<()>,
    {
        let total = jobs.len() as u64;
        if total == 0 {
            return Ok(StoredArtifacts::default());
        }
        tracing::info!(jobs = total, threads = self.concurrency, "summarizing");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        for job in jobs {
            let semaphore = semaphore.clone();
            let summarizer = self.summarizer.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = summarizer
                    .summarize(&job.content, job.kind, job.file_type, &job.domains)
                    .await;
                (job.path, job.kind, result)
            });
        }

        let mut finished = 0u64;
        let mut stored = StoredArtifacts::default();
        while let Some(joined) = set.join_next().await {
            finished += 1;
            match joined {
                Ok((path, kind, Ok(text))) => {
                    if self.store_artifact(files, &path, kind, &text) {
                        stored.count += 1;
                        stored.paths.insert(path);
                        checkpoint(files, stored.count)?;
                    }
                }
                Ok((path, kind, Err(e))) => {
                    self.errors.push(TaskError::new(path, kind.stage(), e.to_string()));
                }
                Err(e) => {
                    self.errors
                        .push(TaskError::new("<unknown>", "summarize", e.to_string()));
                }
            }
            self.progress.report(ProgressEvent::Summarizing { n: finished, total });
        }
        Ok(stored)
    }

    fn store_artifact(
        &self,
        files: &mut BTreeMap<String, FileRecord>,
        path: &str,
        kind: ArtifactKind,
        text: &str,
    ) -> bool {
        let Some(record) = files.get_mut(path) else {
            return false;
        };
        let location = match self.store.write_summary(kind, path, text) {
            Ok(location) => location,
            Err(e) => {
                self.errors
                    .push(TaskError::new(path, kind.stage(), format!("{:#}", e)));
                return false;
            }
        };
        match record.set_artifact(path, kind, location) {
            Ok(()) => true,
            Err(e) => {
                self.errors
                    .push(TaskError::new(path, kind.stage(), e.to_string()));
                false
            }
        }
    }
}

/// Delete stored summaries that no live record refers to.
pub fn reclaim_orphans(store: &ArtifactStore, files: &BTreeMap<String, FileRecord>) -> usize {
    let live = referenced(files);
    let mut removed = 0;
    for kind in ArtifactKind::ALL {
        for location in store.list_summaries(kind) {
            if !live.contains(location.as_str()) && store.remove_summary(&location) {
                tracing::debug!(location = %location, "removed orphan summary");
                removed += 1;
            }
        }
    }
    removed
}

/// Delete the recorded artifacts of deleted files, unless a live record
/// still refers to the same location.
pub fn remove_deleted(
    store: &ArtifactStore,
    deleted: &BTreeMap<String, FileRecord>,
    files: &BTreeMap<String, FileRecord>,
) -> usize {
    let live = referenced(files);
    let mut removed = 0;
    for record in deleted.values() {
        for (_, location) in record.artifacts() {
            if !live.contains(location) && store.remove_summary(location) {
                removed += 1;
            }
        }
    }
    removed
}

fn referenced(files: &BTreeMap<String, FileRecord>) -> HashSet<&str> {
    files
        .values()
        .flat_map(|record| record.artifacts().map(|(_, location)| location))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::ledger::{build_file_map, diff_files};
    use crate::llm::{ChatRequest, LlmClient, LlmSettings, RetryPolicy, TextGenerator};
    use crate::models::ScannedFile;
    use crate::progress::NoProgress;
    use crate::tokenizer::ByteTokenizer;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Fails requests mentioning `FAIL`, answers the rest.
    struct Picky;

    #[async_trait]
    impl TextGenerator for Picky {
        async fn generate(&self, request: &ChatRequest) -> Result<String, LlmError> {
            if request.messages[1].content.contains("FAIL") {
                Err(LlmError::Rejected {
                    status: 400,
                    body: "no".into(),
                })
            } else {
                Ok("Short description.".into())
            }
        }
    }

    fn scheduler(store: &ArtifactStore, errors: Arc<ErrorLog>) -> Scheduler {
        let llm = LlmClient::new(
            Arc::new(Picky),
            Arc::new(ByteTokenizer),
            LlmSettings {
                model: "test".into(),
                temperature: 0.0,
                max_tokens: 64,
                context_limit: 4096,
            },
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                jitter_factor: 0.0,
                timeout_floor: Duration::from_secs(5),
                timeout_ceiling: Duration::from_secs(5),
            },
        );
        let summarizer = Arc::new(Summarizer::new(Arc::new(llm), "en", 1024));
        Scheduler::new(summarizer, store.clone(), 2, errors, Arc::new(NoProgress))
    }

    fn scanned(path: &str, content: &str, file_type: FileType) -> ScannedFile {
        ScannedFile {
            path: path.into(),
            content: content.into(),
            size: content.len() as u64,
            file_type,
            domains: BTreeSet::new(),
        }
    }

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(&dir.path().join("cache"), &dir.path().join("docs"));
        store.ensure_dirs().unwrap();
        (dir, store)
    }

    fn current_map(diff: &DiffPartition) -> BTreeMap<String, FileRecord> {
        diff.added
            .iter()
            .chain(&diff.modified)
            .chain(&diff.unchanged)
            .map(|(p, r)| (p.clone(), r.clone()))
            .collect()
    }

    #[test]
    fn new_files_get_every_applicable_kind() {
        let (_dir, store) = store();
        let (current, contents) = build_file_map(&[
            scanned("src/app.py", "x = 1", FileType::Code),
            scanned("tests/test_app.py", "assert 1", FileType::Code),
            scanned("conf.toml", "a = 1", FileType::Config),
        ]);
        let diff = diff_files(&BTreeMap::new(), &current);
        let mut files = current_map(&diff);
        let jobs = plan_work(&diff, &mut files, &contents, &store);
        let planned: Vec<(&str, ArtifactKind)> =
            jobs.iter().map(|j| (j.path.as_str(), j.kind)).collect();
        assert_eq!(
            planned,
            vec![
                ("conf.toml", ArtifactKind::Summary),
                ("conf.toml", ArtifactKind::ConfigSummary),
                ("src/app.py", ArtifactKind::Summary),
                ("src/app.py", ArtifactKind::ModuleSummary),
                ("tests/test_app.py", ArtifactKind::Summary),
            ]
        );
    }

    #[test]
    fn unchanged_with_missing_artifact_is_rescheduled() {
        let (_dir, store) = store();
        let (mut prior, contents) = build_file_map(&[
            scanned("a.md", "hello", FileType::Docs),
            scanned("b.md", "world", FileType::Docs),
        ]);
        let a = store.write_summary(ArtifactKind::Summary, "a.md", "A").unwrap();
        prior
            .get_mut("a.md")
            .unwrap()
            .set_artifact("a.md", ArtifactKind::Summary, a)
            .unwrap();
        prior
            .get_mut("b.md")
            .unwrap()
            .set_artifact("b.md", ArtifactKind::Summary, "files/b_md.md".into())
            .unwrap();

        let (current, _) = build_file_map(&[
            scanned("a.md", "hello", FileType::Docs),
            scanned("b.md", "world", FileType::Docs),
        ]);
        let diff = diff_files(&prior, &current);
        let mut files = current_map(&diff);
        let jobs = plan_work(&diff, &mut files, &contents, &store);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].path, "b.md");
        assert!(files["b.md"].artifact(ArtifactKind::Summary).is_none());
        assert!(files["a.md"].artifact(ArtifactKind::Summary).is_some());
    }

    #[test]
    fn orphans_and_deleted_artifacts_are_removed() {
        let (_dir, store) = store();
        let keep = store.write_summary(ArtifactKind::Summary, "keep.py", "k").unwrap();
        let gone = store.write_summary(ArtifactKind::Summary, "gone.py", "g").unwrap();
        let stray = store
            .write_summary(ArtifactKind::ConfigSummary, "stray.yaml", "s")
            .unwrap();

        let (mut files, _) = build_file_map(&[scanned("keep.py", "k", FileType::Code)]);
        files
            .get_mut("keep.py")
            .unwrap()
            .set_artifact("keep.py", ArtifactKind::Summary, keep.clone())
            .unwrap();
        let (mut deleted, _) = build_file_map(&[scanned("gone.py", "g", FileType::Code)]);
        deleted
            .get_mut("gone.py")
            .unwrap()
            .set_artifact("gone.py", ArtifactKind::Summary, gone.clone())
            .unwrap();

        assert_eq!(remove_deleted(&store, &deleted, &files), 1);
        assert_eq!(reclaim_orphans(&store, &files), 1);
        assert!(store.summary_exists(&keep));
        assert!(!store.summary_exists(&gone));
        assert!(!store.summary_exists(&stray));
    }

    #[tokio::test]
    async fn run_reports_stored_paths() {
        let (_dir, store) = store();
        let (current, contents) = build_file_map(&[
            scanned("a.md", "alpha", FileType::Docs),
            scanned("b.md", "FAIL here", FileType::Docs),
            scanned("c.toml", "k = 1", FileType::Config),
        ]);
        let diff = diff_files(&BTreeMap::new(), &current);
        let mut files = current_map(&diff);
        let jobs = plan_work(&diff, &mut files, &contents, &store);
        assert_eq!(jobs.len(), 4);

        let errors = Arc::new(ErrorLog::new());
        let mut checkpoints = Vec::new();
        let stored = scheduler(&store, errors.clone())
            .run(jobs, &mut files, |_, n| {
                checkpoints.push(n);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(stored.count, 3);
        assert_eq!(
            stored.paths,
            BTreeSet::from(["a.md".to_string(), "c.toml".to_string()])
        );
        assert_eq!(checkpoints, vec![1, 2, 3]);
        assert_eq!(errors.len(), 1);
        assert!(files["b.md"].artifact(ArtifactKind::Summary).is_none());
        assert!(files["c.toml"].artifact(ArtifactKind::ConfigSummary).is_some());
    }
}
