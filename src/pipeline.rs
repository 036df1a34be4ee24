//! One generation run from scanned files to written docs.
//!
//! ```text
//! scan ─▶ ledger diff ─▶ plan_work ─▶ scheduler ─▶ reclaim
//!                                                     │
//!   ledger save ◀─ manifest/cleanup ◀─ pages ◀─ render ◀─ policy
//! ```
//!
//! The ledger is checkpointed after every stored summary, so a run that
//! dies midway resumes from what it already produced. Fatal errors are
//! limited to the output tree (uncreatable directories, failed ledger or
//! page writes); service failures are collected in [`RunReport::errors`].

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::artifacts::ArtifactStore;
use crate::compressor::ContextCompressor;
use crate::config::{Config, OutputConfig};
use crate::ledger::{build_file_map, ContentLedger};
use crate::llm::{LlmClient, TextGenerator};
use crate::models::{DiffPartition, ErrorLog, FileRecord, ScannedFile, SectionLog, TaskError};
use crate::output;
use crate::policy::{self, ForceSet, FullRebuildReason, RegenConfig};
use crate::progress::{NoProgress, ProgressReporter};
use crate::render::{RenderInputs, Renderer};
use crate::response_cache::ResponseCache;
use crate::scheduler::{self, Scheduler};
use crate::summarize::Summarizer;
use crate::tokenizer::Tokenizer;

/// Where a run reads and writes, resolved against the output root.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub root: PathBuf,
    pub docs_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl OutputPaths {
    pub fn resolve(config: &OutputConfig, root: &Path) -> Self {
        let under = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            }
        };
        Self {
            root: root.to_path_buf(),
            docs_dir: under(&config.docs_dir),
            cache_dir: under(&config.cache_dir),
        }
    }

    /// Exclude globs for the docs and cache trees when they sit inside
    /// `source_root`.
    pub fn scan_excludes(&self, source_root: &Path) -> Vec<String> {
        [&self.docs_dir, &self.cache_dir]
            .into_iter()
            .filter_map(|dir| dir.strip_prefix(source_root).ok())
            .map(|rel| {
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .filter(|rel| !rel.is_empty())
            .map(|rel| format!("{}/**", rel))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub force: ForceSet,
    pub readme: bool,
    pub force_readme: bool,
    pub project_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub summarized: usize,
    pub regenerated: Vec<String>,
    pub errors: Vec<TaskError>,
    pub full_rebuild: Option<FullRebuildReason>,
    pub remote_calls: u64,
    pub pages_written: usize,
    pub pages_removed: Vec<String>,
    pub summaries_removed: usize,
    pub readme_written: bool,
}

/// Compare scanned files against the ledger without touching anything.
pub fn status(cache_dir: &Path, files: &[ScannedFile]) -> DiffPartition {
    let ledger = ContentLedger::open(cache_dir);
    let (current, _) = build_file_map(files);
    ledger.diff(&current)
}

pub struct Pipeline {
    config: Config,
    paths: OutputPaths,
    generator: Arc<dyn TextGenerator>,
    tokenizer: Arc<dyn Tokenizer>,
    progress: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        output_root: &Path,
        generator: Arc<dyn TextGenerator>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        let paths = OutputPaths::resolve(&config.output, output_root);
        Self {
            config,
            paths,
            generator,
            tokenizer,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn paths(&self) -> &OutputPaths {
        &self.paths
    }

    pub async fn run(&self, files: Vec<ScannedFile>, options: &GenerateOptions) -> Result<RunReport> {
        let generation = &self.config.generation;
        let store = ArtifactStore::new(&self.paths.cache_dir, &self.paths.docs_dir);
        store.ensure_dirs()?;
        let existing = store.list_pages();

        let ledger = ContentLedger::open(&self.paths.cache_dir);
        let (current, contents) = build_file_map(&files);
        drop(files);
        let mut diff = ledger.diff(&current);
        tracing::info!(
            added = diff.added.len(),
            modified = diff.modified.len(),
            deleted = diff.deleted.len(),
            unchanged = diff.unchanged.len(),
            "compared with ledger"
        );

        let mut records: BTreeMap<String, FileRecord> = diff
            .added
            .iter()
            .chain(diff.modified.iter())
            .chain(diff.unchanged.iter())
            .map(|(path, record)| (path.clone(), record.clone()))
            .collect();

        let cache = if self.config.output.use_cache {
            Some(Arc::new(ResponseCache::open(&self.paths.cache_dir)))
        } else {
            None
        };
        let mut client =
            LlmClient::from_config(&self.config, self.generator.clone(), self.tokenizer.clone());
        if let Some(cache) = &cache {
            client = client.with_cache(cache.clone());
        }
        let llm = Arc::new(client);
        let errors = Arc::new(ErrorLog::new());

        // Summaries
        let summarizer = Arc::new(Summarizer::new(
            llm.clone(),
            generation.language.clone(),
            generation.summary_chunk_tokens,
        ));
        let jobs = scheduler::plan_work(&diff, &mut records, &contents, &store);
        let runner = Scheduler::new(
            summarizer,
            store.clone(),
            generation.threads,
            errors.clone(),
            self.progress.clone(),
        );
        let prior_sections = ledger.last_sections().clone();
        let flush_every = generation.cache_flush_every.max(1);
        let stored = runner
            .run(jobs, &mut records, |files, stored| {
                ledger.save(files, &prior_sections)?;
                if stored % flush_every == 0 {
                    flush_cache(cache.as_deref());
                }
                Ok(())
            })
            .await?;
        ledger.save(&records, &prior_sections)?;
        diff.mark_refreshed(&stored.paths);
        if !diff.refreshed.is_empty() {
            tracing::info!(files = diff.refreshed.len(), "rebuilt missing summaries");
        }

        let mut summaries_removed = scheduler::remove_deleted(&store, &diff.deleted, &records);
        summaries_removed += scheduler::reclaim_orphans(&store, &records);
        if summaries_removed > 0 {
            tracing::info!(removed = summaries_removed, "reclaimed summaries");
        }

        // Sections
        let regen = RegenConfig::from_config(&self.config);
        let plan = policy::plan(&regen, &records, &diff, &options.force, &existing);
        if let Some(reason) = &plan.full_rebuild {
            tracing::info!("full rebuild: {}", reason);
        }
        let compressor = Arc::new(ContextCompressor::new(llm.clone(), generation.language.clone()));
        let renderer = Renderer::new(
            llm.clone(),
            compressor,
            store.clone(),
            regen,
            generation.language.clone(),
            self.config.input_budget(),
            errors.clone(),
            self.progress.clone(),
        );
        let inputs = RenderInputs {
            files: &records,
            contents: &contents,
            diff: &diff,
            existing: &existing,
        };
        let rendered = renderer.render(&plan, &inputs).await;

        // Output tree
        let pages_written = output::write_pages(&store, &rendered.pages)?;
        let mut pages_removed: Vec<String> = rendered
            .remove
            .iter()
            .filter(|page| store.remove_page(page))
            .cloned()
            .collect();
        if diff.has_changes() {
            pages_removed.extend(output::remove_orphan_pages(&store, &rendered.keep));
        }
        let manifest = output::build_manifest(&store, &plan, &rendered.keep);
        output::write_manifest(&store, &manifest)?;

        let mut readme_written = false;
        if options.readme {
            match renderer
                .readme(&options.project_name, &rendered.overview_context)
                .await
            {
                Ok(text) => {
                    readme_written =
                        output::write_readme(&self.paths.root, &text, options.force_readme)?;
                }
                Err(e) => errors.push(TaskError::new("README.md", "readme", e.to_string())),
            }
        }

        ledger.save(
            &records,
            &SectionLog {
                regenerated: rendered.regenerated.clone(),
            },
        )?;
        flush_cache(cache.as_deref());

        Ok(RunReport {
            added: diff.added.len(),
            modified: diff.modified.len(),
            deleted: diff.deleted.len(),
            unchanged: diff.unchanged.len(),
            summarized: stored.count,
            regenerated: rendered.regenerated,
            errors: errors.snapshot(),
            full_rebuild: plan.full_rebuild,
            remote_calls: llm.remote_calls(),
            pages_written,
            pages_removed,
            summaries_removed,
            readme_written,
        })
    }
}

fn flush_cache(cache: Option<&ResponseCache>) {
    if let Some(cache) = cache {
        if let Err(e) = cache.save() {
            tracing::warn!("response cache not saved: {:#}", e);
        }
    }
}
