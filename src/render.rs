//! Section rendering: turns a [`RegenPlan`] into page text.
//!
//! Every stale generated section compresses its inputs to the context
//! budget (focus = the section title) and issues one request. Those
//! requests run concurrently under the section cap. A failed section is
//! recorded and its previous page is left in place.
//!
//! The testing page, collection member pages and collection indexes other
//! than the modules introduction are built without the service.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::artifacts::ArtifactStore;
use crate::compressor::ContextCompressor;
use crate::error::LlmError;
use crate::facts;
use crate::llm::{ChatMessage, LlmClient};
use crate::models::{ArtifactKind, DiffPartition, ErrorLog, FileRecord, TaskError};
use crate::policy::{CollectionPlan, RegenConfig, RegenPlan, MODULES_DIR};
use crate::progress::{ProgressEvent, ProgressReporter};

const GLOSSARY_PAGE: &str = "glossary.md";
const DEPENDENCIES_PAGE: &str = "dependencies.md";

/// What the renderer reads.
pub struct RenderInputs<'a> {
    pub files: &'a BTreeMap<String, FileRecord>,
    pub contents: &'a HashMap<String, Arc<str>>,
    pub diff: &'a DiffPartition,
    /// Pages present under the docs root before this run.
    pub existing: &'a BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct RenderOutput {
    /// Pages to write, keyed by relative path.
    pub pages: BTreeMap<String, String>,
    /// Pages that belong to the current output, written or not.
    pub keep: BTreeSet<String>,
    /// Pages to delete regardless of input changes.
    pub remove: Vec<String>,
    /// Titles of rebuilt sections, sorted.
    pub regenerated: Vec<String>,
    /// Overview text without its heading.
    pub overview_context: String,
}

/// Drop a leading heading that repeats `title`.
pub fn strip_duplicate_heading(content: &str, title: &str) -> String {
    let mut lines = content.lines();
    if let Some(first) = lines.next() {
        let first = first.trim();
        if first.starts_with('#')
            && first.trim_start_matches('#').trim().to_lowercase() == title.trim().to_lowercase()
        {
            return lines.collect::<Vec<_>>().join("\n").trim_start().to_string();
        }
    }
    content.to_string()
}

/// Page text with its first line dropped when that line is a heading.
fn without_heading(page: &str) -> String {
    let mut lines = page.lines();
    match lines.next() {
        Some(first) if first.trim_start().starts_with('#') => {
            lines.collect::<Vec<_>>().join("\n").trim().to_string()
        }
        _ => page.trim().to_string(),
    }
}

fn section_prompt(title: &str, language: &str, mermaid: bool) -> String {
    let mut prompt = format!(
        "You are an experienced technical writer. Write a documentation section in Markdown. \
         Language: {}. Section: {}. Use the provided context. Avoid filler, give practical details.",
        language, title
    );
    if mermaid {
        prompt.push_str(
            " Start the section with a Mermaid architecture diagram in a \
             ```mermaid``` block showing the main components and data flows. \
             Use `-->` for edges, never a bare `>`. Do not use parentheses anywhere \
             inside the diagram; put labels in square brackets.",
        );
    }
    prompt
}

async fn generate_section(
    llm: &LlmClient,
    title: &str,
    context: &str,
    language: &str,
    mermaid: bool,
) -> Result<String, LlmError> {
    let text = llm
        .chat(vec![
            ChatMessage::system(section_prompt(title, language, mermaid)),
            ChatMessage::user(context),
        ])
        .await?;
    Ok(strip_duplicate_heading(text.trim(), title))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Page,
    ModulesIntro,
}

struct SectionJob {
    target: Target,
    page: String,
    title: String,
    label: String,
    texts: Arc<Vec<String>>,
    mermaid: bool,
}

pub struct Renderer {
    llm: Arc<LlmClient>,
    compressor: Arc<ContextCompressor>,
    store: ArtifactStore,
    config: RegenConfig,
    language: String,
    input_budget: usize,
    errors: Arc<ErrorLog>,
    progress: Arc<dyn ProgressReporter>,
}

impl Renderer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<LlmClient>,
        compressor: Arc<ContextCompressor>,
        store: ArtifactStore,
        config: RegenConfig,
        language: impl Into<String>,
        input_budget: usize,
        errors: Arc<ErrorLog>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            llm,
            compressor,
            store,
            config,
            language: language.into(),
            input_budget,
            errors,
            progress,
        }
    }

    /// Stored summaries of `kind` for the given records, in path order.
    fn summaries<'a>(
        &self,
        records: impl Iterator<Item = (&'a String, &'a FileRecord)>,
        kind: ArtifactKind,
    ) -> Vec<String> {
        records
            .filter_map(|(_, r)| r.artifact(kind))
            .filter_map(|location| self.store.read_summary(location))
            .collect()
    }

    pub async fn render(&self, plan: &RegenPlan, inputs: &RenderInputs<'_>) -> RenderOutput {
        let mut out = RenderOutput::default();
        let all_summaries = Arc::new(self.summaries(inputs.files.iter(), ArtifactKind::Summary));

        // Overview: the compressed summaries themselves, no extra request.
        let overview = &plan.overview;
        out.keep.insert(overview.page.clone());
        if overview.state.is_stale() {
            self.progress.report(ProgressEvent::Rendering {
                section: overview.title.clone(),
            });
            let context = self
                .compressor
                .compress(&all_summaries, self.input_budget, "overview", &overview.title)
                .await;
            out.pages.insert(
                overview.page.clone(),
                format!("# {}\n\n{}\n", overview.title, context),
            );
            out.regenerated.push(overview.title.clone());
            out.overview_context = context;
        } else if let Some(text) = self.store.read_page(&overview.page) {
            out.overview_context = without_heading(&text);
        }

        let mut jobs = Vec::new();
        for section in &plan.fixed {
            out.keep.insert(section.page.clone());
            if !section.state.is_stale() {
                continue;
            }
            tracing::info!(section = %section.key, state = ?section.state, "regenerating section");
            if section.key == "testing" {
                let info = facts::collect_test_info(inputs.contents);
                out.pages.insert(
                    section.page.clone(),
                    format!("# {}\n\n{}", section.title, facts::render_testing(&info)),
                );
                out.regenerated.push(section.title.clone());
                continue;
            }
            jobs.push(SectionJob {
                target: Target::Page,
                page: section.page.clone(),
                title: section.title.clone(),
                label: format!("section:{}", section.key),
                texts: all_summaries.clone(),
                mermaid: section.key == "architecture",
            });
        }

        for domain in &plan.domains {
            out.keep.insert(domain.page.clone());
            if !domain.state.is_stale() {
                continue;
            }
            let texts = self.summaries(
                inputs
                    .files
                    .iter()
                    .filter(|(_, r)| r.domains.contains(&domain.key)),
                ArtifactKind::Summary,
            );
            if texts.is_empty() {
                tracing::debug!(domain = %domain.key, "no summaries for domain, keeping page");
                continue;
            }
            tracing::info!(domain = %domain.key, state = ?domain.state, "regenerating domain page");
            jobs.push(SectionJob {
                target: Target::Page,
                page: domain.page.clone(),
                title: domain.title.clone(),
                label: format!("domain:{}", domain.key),
                texts: Arc::new(texts),
                mermaid: false,
            });
        }

        out.keep.insert(plan.index.page.clone());
        if plan.index.state.is_stale() {
            jobs.push(SectionJob {
                target: Target::Page,
                page: plan.index.page.clone(),
                title: plan.index.title.clone(),
                label: "section:index".into(),
                texts: all_summaries.clone(),
                mermaid: false,
            });
        }

        let modules = &plan.modules;
        if modules.state.is_stale() && !modules.members.is_empty() {
            let texts: Vec<String> = modules
                .members
                .iter()
                .filter_map(|m| self.store.read_summary(&m.summary))
                .collect();
            jobs.push(SectionJob {
                target: Target::ModulesIntro,
                page: format!("{}/index.md", MODULES_DIR),
                title: modules.title.clone(),
                label: "modules".into(),
                texts: Arc::new(texts),
                mermaid: false,
            });
        }

        let mut modules_intro = None;
        for (job, body) in self.run_sections(jobs).await {
            match job.target {
                Target::ModulesIntro => modules_intro = Some(body),
                Target::Page => {
                    out.pages
                        .insert(job.page, format!("# {}\n\n{}\n", job.title, body));
                    out.regenerated.push(job.title);
                }
            }
        }

        self.render_collection(modules, true, modules_intro.as_deref(), "Module list", &mut out);
        self.render_collection(&plan.configs, false, None, "Configuration files", &mut out);

        if let Some(page) = out.pages.get_mut(DEPENDENCIES_PAGE) {
            let deps = facts::collect_dependencies(inputs.contents);
            if !deps.is_empty() {
                let list: Vec<String> = deps.iter().map(|d| format!("- {}", d)).collect();
                page.push_str(&format!("\n## Detected dependencies\n\n{}\n", list.join("\n")));
            }
        }

        if !out.pages.contains_key(GLOSSARY_PAGE) && !inputs.existing.contains(GLOSSARY_PAGE) {
            let title = self
                .config
                .sections
                .iter()
                .find(|(k, _)| k == "glossary")
                .map(|(_, t)| t.clone())
                .unwrap_or_else(|| "Glossary".to_string());
            out.pages
                .insert(GLOSSARY_PAGE.to_string(), format!("# {}\n\n- TBD\n", title));
            out.regenerated.push(title);
        }
        out.keep.insert(GLOSSARY_PAGE.to_string());

        out.regenerated.sort();
        out.regenerated.dedup();

        let changes = &plan.changes;
        out.keep.insert(changes.page.clone());
        if changes.state.is_stale() {
            let summary = self.change_summary(inputs).await;
            out.pages.insert(
                changes.page.clone(),
                format_changes(&changes.title, inputs.diff, &out.regenerated, &summary),
            );
        }

        out.remove = plan.orphan_domains.clone();
        out
    }

    async fn run_sections(&self, jobs: Vec<SectionJob>) -> Vec<(SectionJob, String)> {
        let semaphore = Arc::new(Semaphore::new(self.config.section_concurrency));
        let mut set = JoinSet::new();
        for job in jobs {
            let semaphore = semaphore.clone();
            let llm = self.llm.clone();
            let compressor = self.compressor.clone();
            let progress = self.progress.clone();
            let language = self.language.clone();
            let budget = self.input_budget;
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                progress.report(ProgressEvent::Rendering {
                    section: job.title.clone(),
                });
                let context = compressor
                    .compress(&job.texts, budget, &job.label, &job.title)
                    .await;
                let result =
                    generate_section(&llm, &job.title, &context, &language, job.mermaid).await;
                (job, result)
            });
        }

        let mut done = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((job, Ok(body))) => done.push((job, body)),
                Ok((job, Err(e))) => {
                    self.errors
                        .push(TaskError::new(job.page, "render section", e.to_string()));
                }
                Err(e) => {
                    self.errors
                        .push(TaskError::new("<unknown>", "render section", e.to_string()));
                }
            }
        }
        done
    }

    /// Member pages always; index pages when the collection is stale.
    fn render_collection(
        &self,
        collection: &CollectionPlan,
        needs_intro: bool,
        intro: Option<&str>,
        list_heading: &str,
        out: &mut RenderOutput,
    ) {
        for member in &collection.members {
            out.keep.insert(member.page.clone());
            match self.store.read_summary(&member.summary) {
                Some(summary) => {
                    out.pages.insert(
                        member.page.clone(),
                        format!("# {}\n\n{}\n", member.title, summary),
                    );
                }
                None => self.errors.push(TaskError::new(
                    member.source_path.clone(),
                    "render page",
                    format!("summary missing: {}", member.summary),
                )),
            }
        }
        if collection.members.is_empty() {
            return;
        }
        out.keep
            .extend(collection.index_pages(self.config.page_size));
        if !collection.state.is_stale() || (needs_intro && intro.is_none()) {
            return;
        }
        tracing::info!(collection = %collection.key, state = ?collection.state, "regenerating index");
        for (page, text) in paginate(collection, self.config.page_size, intro, list_heading) {
            out.pages.insert(page, text);
        }
        out.regenerated.push(collection.title.clone());
    }

    async fn change_summary(&self, inputs: &RenderInputs<'_>) -> String {
        if !inputs.diff.has_changes() {
            return "No changes.".to_string();
        }
        let changed = inputs
            .diff
            .added
            .keys()
            .chain(inputs.diff.modified.keys())
            .filter_map(|path| inputs.files.get_key_value(path));
        let texts = self.summaries(changed, ArtifactKind::Summary);
        let title = "Summary of changes";
        let context = self
            .compressor
            .compress(&texts, self.input_budget, "changes", title)
            .await;
        match generate_section(&self.llm, title, &context, &self.language, false).await {
            Ok(text) => text,
            Err(e) => {
                self.errors
                    .push(TaskError::new("changes.md", "render section", e.to_string()));
                "Summary unavailable.".to_string()
            }
        }
    }

    /// README text seeded by the overview.
    pub async fn readme(&self, project: &str, overview_context: &str) -> Result<String, LlmError> {
        let prompt = format!(
            "Write a README.md for the project {}. Structure: Overview, Quick start, \
             Architecture (brief), Links to docs. Keep it short and useful. Language: {}.",
            project, self.language
        );
        let text = self
            .llm
            .chat(vec![ChatMessage::system(prompt), ChatMessage::user(overview_context)])
            .await?;
        Ok(text.trim().to_string())
    }
}

/// Index pages of a collection with previous/next navigation.
pub fn paginate(
    collection: &CollectionPlan,
    page_size: usize,
    intro: Option<&str>,
    list_heading: &str,
) -> Vec<(String, String)> {
    let page_names = collection.index_pages(page_size);
    let total = page_names.len();
    let prefix = format!("{}/", collection.dir);
    collection
        .members
        .chunks(page_size.max(1))
        .zip(page_names.iter())
        .enumerate()
        .map(|(idx, (members, name))| {
            let n = idx + 1;
            let toc: Vec<String> = members
                .iter()
                .map(|m| {
                    let link = m.page.strip_prefix(&prefix).unwrap_or(&m.page);
                    format!("- [{}]({})", m.title, link)
                })
                .collect();

            let mut nav = Vec::new();
            if n > 1 {
                let prev = if n == 2 {
                    "index.md".to_string()
                } else {
                    format!("page-{}.md", n - 1)
                };
                nav.push(format!("[← Previous]({})", prev));
            }
            if n < total {
                nav.push(format!("[Next →](page-{}.md)", n + 1));
            }

            let header = if n == 1 {
                format!("# {}\n", collection.title)
            } else {
                format!("# {} (page {})\n", collection.title, n)
            };
            let mut parts = Vec::new();
            if n == 1 {
                if let Some(intro) = intro {
                    parts.push(intro.to_string());
                }
            }
            parts.push(format!("## {}", list_heading));
            parts.push(toc.join("\n"));
            if !nav.is_empty() {
                parts.push(format!("\n{}\n", nav.join(" · ")));
            }
            (name.clone(), format!("{}\n{}\n", header, parts.join("\n\n")))
        })
        .collect()
}

/// The changes page.
pub fn format_changes(
    title: &str,
    diff: &DiffPartition,
    regenerated: &[String],
    summary: &str,
) -> String {
    fn list<'a>(heading: &str, items: impl Iterator<Item = &'a String>) -> String {
        let lines: Vec<String> = items.map(|p| format!("- {}", p)).collect();
        if lines.is_empty() {
            format!("## {}\n\n- none\n", heading)
        } else {
            format!("## {}\n\n{}\n", heading, lines.join("\n"))
        }
    }

    let mut md = format!("# {}\n\n", title);
    md.push_str(&list("Added files", diff.added.keys()));
    md.push_str(&list("Modified files", diff.modified.keys()));
    md.push_str(&list("Deleted files", diff.deleted.keys()));
    md.push_str(&list("Regenerated sections", regenerated.iter()));
    md.push_str(&format!("\n## Summary\n\n{}\n", summary.trim()));
    md
}
