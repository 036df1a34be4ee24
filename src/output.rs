//! Writing the docs tree: pages, the `_index.json` manifest, orphan
//! cleanup and the optional README.
//!
//! Page writes are fatal on failure. Orphan cleanup only runs when the
//! run observed input changes, so a no-change run never deletes output.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::artifacts::ArtifactStore;
use crate::policy::{CollectionPlan, RegenPlan, MANIFEST_PAGE};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ManifestSection {
    pub id: String,
    pub title: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub path: String,
    pub source_path: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub sections: Vec<ManifestSection>,
    pub modules: Vec<ManifestEntry>,
    pub configs: Vec<ManifestEntry>,
    pub files: Vec<String>,
    pub generated_at: String,
}

/// First one or two non-heading lines of the first paragraph.
pub fn first_paragraph(text: &str) -> String {
    let mut lines = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            if !lines.is_empty() {
                break;
            }
            continue;
        }
        if line.starts_with('#') || line.starts_with("```") {
            continue;
        }
        lines.push(line);
        if lines.len() >= 2 {
            break;
        }
    }
    lines.join(" ")
}

/// Write every page. Any failure aborts the run.
pub fn write_pages(store: &ArtifactStore, pages: &BTreeMap<String, String>) -> Result<usize> {
    for (rel, text) in pages {
        store.write_page(rel, text)?;
    }
    Ok(pages.len())
}

fn entries(store: &ArtifactStore, collection: &CollectionPlan) -> Vec<ManifestEntry> {
    collection
        .members
        .iter()
        .map(|m| ManifestEntry {
            name: m.title.clone(),
            path: m.page.clone(),
            source_path: m.source_path.clone(),
            summary: store
                .read_summary(&m.summary)
                .map(|s| first_paragraph(&s))
                .unwrap_or_default(),
        })
        .collect()
}

/// Describe the docs tree as it stands after pages were written.
pub fn build_manifest(store: &ArtifactStore, plan: &RegenPlan, keep: &BTreeSet<String>) -> Manifest {
    let on_disk = store.list_pages();
    let present = |page: &str| on_disk.contains(page);

    let mut sections: Vec<ManifestSection> = plan
        .sections()
        .filter(|s| present(&s.page))
        .map(|s| ManifestSection {
            id: s.key.clone(),
            title: s.title.clone(),
            path: s.page.clone(),
        })
        .collect();
    for collection in [&plan.modules, &plan.configs] {
        let index = format!("{}/index.md", collection.dir);
        if present(&index) {
            sections.push(ManifestSection {
                id: collection.key.clone(),
                title: collection.title.clone(),
                path: index,
            });
        }
    }

    let mut files: BTreeSet<String> = on_disk
        .into_iter()
        .filter(|p| keep.contains(p))
        .collect();
    files.insert(MANIFEST_PAGE.to_string());

    Manifest {
        sections,
        modules: entries(store, &plan.modules),
        configs: entries(store, &plan.configs),
        files: files.into_iter().collect(),
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

/// Write the manifest unless only its timestamp would change.
pub fn write_manifest(store: &ArtifactStore, manifest: &Manifest) -> Result<bool> {
    let mut fresh = serde_json::to_value(manifest)?;
    if let Some(existing) = store.read_page(MANIFEST_PAGE) {
        if let Ok(mut old) = serde_json::from_str::<serde_json::Value>(&existing) {
            if let (Some(old_map), Some(new_map)) = (old.as_object_mut(), fresh.as_object_mut()) {
                let old_stamp = old_map.remove("generated_at");
                let new_stamp = new_map.remove("generated_at");
                if old_map == new_map {
                    return Ok(false);
                }
                if let Some(stamp) = new_stamp.or(old_stamp) {
                    new_map.insert("generated_at".into(), stamp);
                }
            }
        }
    }
    let text = serde_json::to_string_pretty(&fresh)? + "\n";
    store.write_page(MANIFEST_PAGE, &text)?;
    Ok(true)
}

/// Delete files under the docs root that are not in `keep`.
pub fn remove_orphan_pages(store: &ArtifactStore, keep: &BTreeSet<String>) -> Vec<String> {
    let mut removed = Vec::new();
    for page in store.list_pages() {
        if page == MANIFEST_PAGE || keep.contains(&page) {
            continue;
        }
        if store.remove_page(&page) {
            tracing::debug!(page = %page, "removed orphan page");
            removed.push(page);
        }
    }
    removed
}

/// Write `README.md` under `root`; an existing README is kept unless
/// `force` is set. Returns whether the file was written.
pub fn write_readme(root: &Path, text: &str, force: bool) -> Result<bool> {
    let path = root.join("README.md");
    if path.exists() && !force {
        tracing::info!("README.md exists, not overwriting (use --force)");
        return Ok(false);
    }
    std::fs::write(&path, format!("{}\n", text.trim_end()))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}
