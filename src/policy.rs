//! Regeneration policy: which output sections are rebuilt this run.
//!
//! The plan is a pure function of the current records, the diff, the set
//! of forced targets and the pages already on disk. Each section ends up
//! [`SectionState::Fresh`] or [`SectionState::Stale`] with the first
//! matching reason:
//!
//! | Section | Stale when |
//! |---------|------------|
//! | overview, fixed pages, index | forced, full rebuild, missing, any input change |
//! | domain page | forced, full rebuild, missing, a changed file carries the tag |
//! | modules / configs collection | forced, full rebuild, index missing, a member changed |
//! | changes page | forced, missing, a file was added, modified or deleted |
//!
//! An unchanged file whose summary was rebuilt this run (say after an
//! earlier failure) counts as an input change and as a changed member.
//!
//! A full rebuild is never implicit: it carries a [`FullRebuildReason`]
//! that is logged and reported back to the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::artifacts::slug;
use crate::config::Config;
use crate::models::{is_test_path, ArtifactKind, DiffPartition, FileRecord, FileType};

pub const OVERVIEW_PAGE: &str = "overview.md";
pub const INDEX_PAGE: &str = "index.md";
pub const CHANGES_PAGE: &str = "changes.md";
pub const MANIFEST_PAGE: &str = "_index.json";
pub const MODULES_DIR: &str = "modules";
pub const CONFIGS_DIR: &str = "configs";
pub const DOMAINS_DIR: &str = "domains";

const FIXED_SECTIONS: [(&str, &str); 6] = [
    ("architecture", "Architecture"),
    ("runtime", "Runtime and environment"),
    ("dependencies", "Dependencies"),
    ("testing", "Testing"),
    ("conventions", "Conventions"),
    ("glossary", "Glossary"),
];

const KNOWN_DOMAINS: [(&str, &str); 9] = [
    ("kubernetes", "Kubernetes"),
    ("helm", "Helm"),
    ("terraform", "Terraform"),
    ("ansible", "Ansible"),
    ("docker", "Docker"),
    ("ci", "CI/CD"),
    ("observability", "Observability"),
    ("service_mesh", "Service Mesh / Ingress"),
    ("data_storage", "Data / Storage"),
];

/// Page path of a fixed section.
pub fn section_page(key: &str) -> String {
    format!("{}.md", key)
}

/// Page path of a domain section.
pub fn domain_page(key: &str) -> String {
    format!("{}/{}.md", DOMAINS_DIR, slug(key))
}

/// Page `n` (1-based) of a paginated collection index.
pub fn collection_page(dir: &str, n: usize) -> String {
    if n <= 1 {
        format!("{}/index.md", dir)
    } else {
        format!("{}/page-{}.md", dir, n)
    }
}

/// Member page of a collection: dots become `__` so extensions survive.
/// Names the collection's own pages use (`index`, `page-N`) get a `_`
/// suffix.
pub fn member_page(dir: &str, path: &str) -> String {
    let mut name = path.replace('.', "__");
    if is_collection_page_name(&name) {
        name.push('_');
    }
    format!("{}/{}.md", dir, name)
}

fn is_collection_page_name(name: &str) -> bool {
    name == "index"
        || name
            .strip_prefix("page-")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Titles, thresholds and sizes, built once from [`Config`].
#[derive(Debug, Clone)]
pub struct RegenConfig {
    /// Fixed sections as `(key, title)`, in output order.
    pub sections: Vec<(String, String)>,
    /// Titles of known domain tags, in output order.
    pub domains: Vec<(String, String)>,
    pub overview_title: String,
    pub index_title: String,
    pub modules_title: String,
    pub configs_title: String,
    pub changes_title: String,
    /// Below this many non-test code files every run is a full rebuild.
    /// `0` disables the override.
    pub regen_all_threshold: usize,
    pub page_size: usize,
    pub section_concurrency: usize,
}

impl RegenConfig {
    pub fn from_config(config: &Config) -> Self {
        let title = |key: &str, default: &str| {
            config
                .titles
                .get(key)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            sections: FIXED_SECTIONS
                .iter()
                .map(|(k, t)| (k.to_string(), title(k, t)))
                .collect(),
            domains: KNOWN_DOMAINS
                .iter()
                .map(|(k, t)| (k.to_string(), title(k, t)))
                .collect(),
            overview_title: title("overview", "Project overview"),
            index_title: title("index", "Project documentation"),
            modules_title: title("modules", "Modules"),
            configs_title: title("configs", "Project configuration"),
            changes_title: title("changes", "Changes since last generation"),
            regen_all_threshold: config.generation.regen_all_threshold,
            page_size: config.generation.page_size.max(1),
            section_concurrency: config.generation.section_threads.clamp(1, 4),
        }
    }

    /// Title of a domain tag; unknown tags use the tag itself.
    pub fn domain_title(&self, key: &str) -> String {
        self.domains
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, t)| t.clone())
            .unwrap_or_else(|| key.to_string())
    }
}

impl Default for RegenConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Normalized set of forced targets (`--regen` / `DOC_HARNESS_REGEN`).
#[derive(Debug, Clone, Default)]
pub struct ForceSet {
    targets: BTreeSet<String>,
}

impl ForceSet {
    /// Parse comma-separated items; case and surrounding space are ignored.
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Self {
        let targets = items
            .iter()
            .flat_map(|item| item.as_ref().split(','))
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self { targets }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// `all` or `*` forces everything.
    pub fn all(&self) -> bool {
        self.targets.contains("all") || self.targets.contains("*")
    }

    pub fn matches(&self, aliases: &[&str]) -> bool {
        self.all()
            || aliases
                .iter()
                .any(|a| self.targets.contains(&a.trim().to_lowercase()))
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    Forced,
    FullRebuild,
    Missing,
    InputsChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionState {
    Fresh,
    Stale(StaleReason),
}

impl SectionState {
    fn decide(forced: bool, full_rebuild: bool, missing: bool, changed: bool) -> Self {
        if forced {
            SectionState::Stale(StaleReason::Forced)
        } else if full_rebuild {
            SectionState::Stale(StaleReason::FullRebuild)
        } else if missing {
            SectionState::Stale(StaleReason::Missing)
        } else if changed {
            SectionState::Stale(StaleReason::InputsChanged)
        } else {
            SectionState::Fresh
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, SectionState::Stale(_))
    }
}

/// Why the whole output is being rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FullRebuildReason {
    /// `all` or `*` was forced.
    Forced,
    /// Some, but fewer than the configured threshold, non-test code files.
    /// A repository without code files never qualifies.
    SmallRepository { code_files: usize, threshold: usize },
}

impl fmt::Display for FullRebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FullRebuildReason::Forced => write!(f, "forced"),
            FullRebuildReason::SmallRepository {
                code_files,
                threshold,
            } => write!(
                f,
                "small repository ({} code files < threshold {})",
                code_files, threshold
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SectionPlan {
    pub key: String,
    pub title: String,
    pub page: String,
    pub state: SectionState,
}

/// One file's page within a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMember {
    pub source_path: String,
    pub title: String,
    pub page: String,
    /// Summary location inside the artifact store.
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct CollectionPlan {
    pub key: String,
    pub title: String,
    pub dir: String,
    pub state: SectionState,
    /// Sorted by page path.
    pub members: Vec<CollectionMember>,
}

impl CollectionPlan {
    /// Index pages needed for the current members.
    pub fn index_pages(&self, page_size: usize) -> Vec<String> {
        let count = self.members.len().div_ceil(page_size.max(1)).max(1);
        (1..=count).map(|n| collection_page(&self.dir, n)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct RegenPlan {
    pub full_rebuild: Option<FullRebuildReason>,
    pub overview: SectionPlan,
    pub fixed: Vec<SectionPlan>,
    /// Domains with at least one live file.
    pub domains: Vec<SectionPlan>,
    /// Existing domain pages whose domain has no live file.
    pub orphan_domains: Vec<String>,
    pub index: SectionPlan,
    pub modules: CollectionPlan,
    pub configs: CollectionPlan,
    pub changes: SectionPlan,
}

impl RegenPlan {
    /// Every section plan, collections excluded.
    pub fn sections(&self) -> impl Iterator<Item = &SectionPlan> {
        std::iter::once(&self.overview)
            .chain(self.fixed.iter())
            .chain(self.domains.iter())
            .chain(std::iter::once(&self.index))
            .chain(std::iter::once(&self.changes))
    }
}

/// Non-test code files in `files`.
pub fn count_code_files(files: &BTreeMap<String, FileRecord>) -> usize {
    files
        .iter()
        .filter(|(path, r)| r.file_type == FileType::Code && !is_test_path(path))
        .count()
}

pub fn plan(
    config: &RegenConfig,
    files: &BTreeMap<String, FileRecord>,
    diff: &DiffPartition,
    force: &ForceSet,
    existing: &BTreeSet<String>,
) -> RegenPlan {
    let code_files = count_code_files(files);
    let full_rebuild = if force.all() {
        Some(FullRebuildReason::Forced)
    } else if config.regen_all_threshold > 0
        && code_files > 0
        && code_files < config.regen_all_threshold
    {
        Some(FullRebuildReason::SmallRepository {
            code_files,
            threshold: config.regen_all_threshold,
        })
    } else {
        None
    };
    let full = full_rebuild.is_some();
    let global_change = diff.inputs_changed();
    let missing = |page: &str| !existing.contains(page);

    let overview = SectionPlan {
        key: "overview".into(),
        title: config.overview_title.clone(),
        page: OVERVIEW_PAGE.into(),
        state: SectionState::decide(
            force.matches(&[
                "overview",
                "section:overview",
                OVERVIEW_PAGE,
                config.overview_title.as_str(),
            ]),
            full,
            missing(OVERVIEW_PAGE),
            global_change,
        ),
    };

    let fixed = config
        .sections
        .iter()
        .map(|(key, title)| {
            let page = section_page(key);
            let section_key = format!("section:{}", key);
            let section_title = format!("section:{}", title);
            let forced = force.matches(&[
                key.as_str(),
                title.as_str(),
                section_key.as_str(),
                section_title.as_str(),
                page.as_str(),
            ]);
            SectionPlan {
                key: key.clone(),
                title: title.clone(),
                state: SectionState::decide(forced, full, missing(&page), global_change),
                page,
            }
        })
        .collect();

    // Configured domains first, then any other tag alphabetically.
    let live_domains: BTreeSet<&str> = files
        .values()
        .flat_map(|r| r.domains.iter().map(String::as_str))
        .collect();
    let mut ordered: Vec<String> = config
        .domains
        .iter()
        .filter(|(k, _)| live_domains.contains(k.as_str()))
        .map(|(k, _)| k.clone())
        .collect();
    for tag in &live_domains {
        if !ordered.iter().any(|k| k == tag) {
            ordered.push(tag.to_string());
        }
    }
    let domains: Vec<SectionPlan> = ordered
        .into_iter()
        .map(|key| {
            let title = config.domain_title(&key);
            let page = domain_page(&key);
            let domain_key = format!("domain:{}", key);
            let forced =
                force.matches(&[key.as_str(), title.as_str(), domain_key.as_str(), "domains"]);
            let changed = diff.changed_domains.contains(&key);
            SectionPlan {
                state: SectionState::decide(forced, full, missing(&page), changed),
                key,
                title,
                page,
            }
        })
        .collect();

    let live_pages: BTreeSet<&str> = domains.iter().map(|d| d.page.as_str()).collect();
    let prefix = format!("{}/", DOMAINS_DIR);
    let orphan_domains = existing
        .iter()
        .filter(|p| p.starts_with(&prefix) && p.ends_with(".md"))
        .filter(|p| !live_pages.contains(p.as_str()))
        .cloned()
        .collect();

    let index = SectionPlan {
        key: "index".into(),
        title: config.index_title.clone(),
        page: INDEX_PAGE.into(),
        state: SectionState::decide(
            force.matches(&[
                "index",
                "docs",
                "documentation",
                INDEX_PAGE,
                config.index_title.as_str(),
            ]),
            full,
            missing(INDEX_PAGE),
            global_change,
        ),
    };

    let modules = collection_plan(
        MODULES_DIR,
        &config.modules_title,
        ArtifactKind::ModuleSummary,
        files,
        diff,
        force,
        full,
        existing,
    );
    let configs = collection_plan(
        CONFIGS_DIR,
        &config.configs_title,
        ArtifactKind::ConfigSummary,
        files,
        diff,
        force,
        full,
        existing,
    );

    let changes = SectionPlan {
        key: "changes".into(),
        title: config.changes_title.clone(),
        page: CHANGES_PAGE.into(),
        state: SectionState::decide(
            force.matches(&["changes", CHANGES_PAGE]),
            false,
            missing(CHANGES_PAGE),
            diff.has_changes(),
        ),
    };

    RegenPlan {
        full_rebuild,
        overview,
        fixed,
        domains,
        orphan_domains,
        index,
        modules,
        configs,
        changes,
    }
}

#[allow(clippy::too_many_arguments)]
fn collection_plan(
    dir: &str,
    title: &str,
    kind: ArtifactKind,
    files: &BTreeMap<String, FileRecord>,
    diff: &DiffPartition,
    force: &ForceSet,
    full_rebuild: bool,
    existing: &BTreeSet<String>,
) -> CollectionPlan {
    let member_dir = match kind {
        ArtifactKind::ConfigSummary => format!("{}/files", dir),
        _ => dir.to_string(),
    };
    let mut members: Vec<CollectionMember> = files
        .iter()
        .filter_map(|(path, record)| {
            let summary = record.artifact(kind)?;
            let title = match kind {
                ArtifactKind::ModuleSummary => strip_extension(path).to_string(),
                _ => path.clone(),
            };
            Some(CollectionMember {
                source_path: path.clone(),
                title,
                page: member_page(&member_dir, path),
                summary: summary.to_string(),
            })
        })
        .collect();
    members.sort_by(|a, b| a.page.cmp(&b.page));

    let member_changed = diff
        .changed_records()
        .any(|(path, record)| record.wants(path, kind));
    let index = collection_page(dir, 1);
    let state = SectionState::decide(
        force.matches(&[dir, title]),
        full_rebuild,
        !existing.contains(&index),
        member_changed,
    );

    CollectionPlan {
        key: dir.to_string(),
        title: title.to_string(),
        dir: dir.to_string(),
        state,
        members,
    }
}

/// `src/app.py` → `src/app`; dotfiles keep their name.
fn strip_extension(path: &str) -> &str {
    let name_start = path.rfind('/').map_or(0, |i| i + 1);
    match path[name_start..].rfind('.') {
        Some(dot) if dot > 0 => &path[..name_start + dot],
        _ => path,
    }
}
