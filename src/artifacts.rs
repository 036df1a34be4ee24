//! Artifact store: text blobs at stable, filesystem-safe paths.
//!
//! Two roots are managed:
//!
//! - the **summary tree** (`<cache_dir>/intermediate/{files,modules,configs}`),
//!   one `<slug>.md` per input file and artifact kind;
//! - the **docs root**, where section pages are keyed by their relative
//!   output path (`architecture.md`, `modules/index.md`, ...).
//!
//! Locations recorded in the ledger are relative to the summary tree.
//! A location that is absolute or climbs out with `..` is treated as
//! missing. Writes are plain synchronous filesystem writes, so a write is
//! visible to the next read.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::models::ArtifactKind;

pub const SUMMARY_DIR: &str = "intermediate";

/// Filesystem-safe name for a logical path: every non-alphanumeric
/// character becomes `_`, outer underscores are trimmed, all lowercase.
pub fn slug(path: &str) -> String {
    let replaced: String = path
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    replaced.trim_matches('_').to_lowercase()
}

/// Whether `rel` stays inside the directory it is joined to.
fn is_contained(rel: &str) -> bool {
    let path = Path::new(rel);
    !rel.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    summary_root: PathBuf,
    docs_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(cache_dir: &Path, docs_root: &Path) -> Self {
        Self {
            summary_root: cache_dir.join(SUMMARY_DIR),
            docs_root: docs_root.to_path_buf(),
        }
    }

    pub fn docs_root(&self) -> &Path {
        &self.docs_root
    }

    /// Create every summary subtree and the docs root.
    pub fn ensure_dirs(&self) -> Result<()> {
        for kind in ArtifactKind::ALL {
            let dir = self.summary_root.join(kind.subdir());
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        std::fs::create_dir_all(&self.docs_root)
            .with_context(|| format!("Failed to create {}", self.docs_root.display()))?;
        Ok(())
    }

    // ============ Summaries ============

    /// Location (relative to the summary tree) for `path`'s artifact of `kind`.
    pub fn summary_location(kind: ArtifactKind, path: &str) -> String {
        format!("{}/{}.md", kind.subdir(), slug(path))
    }

    fn summary_file(&self, location: &str) -> Option<PathBuf> {
        is_contained(location).then(|| self.summary_root.join(location))
    }

    /// Store a summary and return its location.
    pub fn write_summary(&self, kind: ArtifactKind, path: &str, text: &str) -> Result<String> {
        let location = Self::summary_location(kind, path);
        let file = self.summary_root.join(&location);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&file, text)
            .with_context(|| format!("Failed to write summary: {}", file.display()))?;
        Ok(location)
    }

    pub fn read_summary(&self, location: &str) -> Option<String> {
        let file = self.summary_file(location)?;
        std::fs::read_to_string(file).ok()
    }

    pub fn summary_exists(&self, location: &str) -> bool {
        self.summary_file(location).is_some_and(|f| f.is_file())
    }

    /// Remove a summary; returns whether a file was deleted.
    pub fn remove_summary(&self, location: &str) -> bool {
        match self.summary_file(location) {
            Some(file) => std::fs::remove_file(file).is_ok(),
            None => false,
        }
    }

    /// Locations of every stored summary of `kind`.
    pub fn list_summaries(&self, kind: ArtifactKind) -> Vec<String> {
        let dir = self.summary_root.join(kind.subdir());
        let mut found = Vec::new();
        for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.summary_root) {
                found.push(to_slash(rel));
            }
        }
        found.sort();
        found
    }

    // ============ Pages ============

    fn page_file(&self, rel: &str) -> Option<PathBuf> {
        is_contained(rel).then(|| self.docs_root.join(rel))
    }

    pub fn write_page(&self, rel: &str, text: &str) -> Result<()> {
        let file = self
            .page_file(rel)
            .with_context(|| format!("Refusing page path outside docs root: {}", rel))?;
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&file, text)
            .with_context(|| format!("Failed to write page: {}", file.display()))
    }

    pub fn read_page(&self, rel: &str) -> Option<String> {
        std::fs::read_to_string(self.page_file(rel)?).ok()
    }

    pub fn page_exists(&self, rel: &str) -> bool {
        self.page_file(rel).is_some_and(|f| f.is_file())
    }

    pub fn remove_page(&self, rel: &str) -> bool {
        match self.page_file(rel) {
            Some(file) => std::fs::remove_file(file).is_ok(),
            None => false,
        }
    }

    /// Relative paths of every file under the docs root.
    pub fn list_pages(&self) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        if !self.docs_root.exists() {
            return found;
        }
        for entry in WalkDir::new(&self.docs_root)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.docs_root) {
                found.insert(to_slash(rel));
            }
        }
        found
    }
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
