//! Content ledger: the hash-keyed snapshot persisted between runs.
//!
//! The ledger lives at `<cache_dir>/index.json` and holds one
//! [`FileRecord`] per tracked path plus the names of the sections rebuilt
//! by the previous run. Change detection is a pure comparison of content
//! hashes against that snapshot; file contents are never re-read.
//!
//! An unreadable or unparsable ledger is treated as empty so that a
//! corrupted cache directory degrades to a full rebuild instead of an
//! aborted run.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::models::{DiffPartition, FileRecord, LedgerSnapshot, ScannedFile, SectionLog};

pub const LEDGER_FILE: &str = "index.json";

/// SHA-256 hex digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Build the current record map and the in-memory content table.
///
/// Duplicate paths: the last entry wins.
pub fn build_file_map(
    files: &[ScannedFile],
) -> (BTreeMap<String, FileRecord>, HashMap<String, Arc<str>>) {
    let mut records = BTreeMap::new();
    let mut contents = HashMap::new();
    for file in files {
        let record = FileRecord::new(
            sha256_hex(file.content.as_bytes()),
            file.size,
            file.file_type,
            file.domains.clone(),
        );
        records.insert(file.path.clone(), record);
        contents.insert(file.path.clone(), Arc::from(file.content.as_str()));
    }
    (records, contents)
}

/// Partition `prior` and `current` by path and hash.
///
/// Unchanged records are carried over from `prior` so they keep their
/// artifact references; added and modified records are the fresh ones
/// from `current`, with no artifacts yet.
pub fn diff_files(
    prior: &BTreeMap<String, FileRecord>,
    current: &BTreeMap<String, FileRecord>,
) -> DiffPartition {
    let mut diff = DiffPartition::default();

    for (path, record) in current {
        match prior.get(path) {
            None => {
                diff.changed_domains.extend(record.domains.iter().cloned());
                diff.added.insert(path.clone(), record.clone());
            }
            Some(old) if old.hash != record.hash => {
                diff.changed_domains.extend(record.domains.iter().cloned());
                diff.changed_domains.extend(old.domains.iter().cloned());
                diff.previous.insert(path.clone(), old.clone());
                diff.modified.insert(path.clone(), record.clone());
            }
            Some(old) => {
                // Metadata from this scan, artifact references from the ledger.
                let mut carried = old.clone();
                carried.size = record.size;
                carried.file_type = record.file_type;
                carried.domains = record.domains.clone();
                diff.unchanged.insert(path.clone(), carried);
            }
        }
    }

    for (path, old) in prior {
        if !current.contains_key(path) {
            diff.changed_domains.extend(old.domains.iter().cloned());
            diff.deleted.insert(path.clone(), old.clone());
        }
    }

    diff
}

/// The persisted snapshot and where it lives.
pub struct ContentLedger {
    path: PathBuf,
    snapshot: LedgerSnapshot,
}

impl ContentLedger {
    /// Load `<cache_dir>/index.json`; missing or corrupt files yield an
    /// empty snapshot.
    pub fn open(cache_dir: &Path) -> Self {
        let path = cache_dir.join(LEDGER_FILE);
        let snapshot = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<LedgerSnapshot>(&text) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "ledger unreadable, starting empty: {}", e);
                    LedgerSnapshot::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LedgerSnapshot::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "ledger unreadable, starting empty: {}", e);
                LedgerSnapshot::default()
            }
        };
        Self { path, snapshot }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records from the last saved snapshot.
    pub fn prior(&self) -> &BTreeMap<String, FileRecord> {
        &self.snapshot.files
    }

    /// Sections rebuilt by the last saved run.
    pub fn last_sections(&self) -> &SectionLog {
        &self.snapshot.sections
    }

    pub fn diff(&self, current: &BTreeMap<String, FileRecord>) -> DiffPartition {
        diff_files(&self.snapshot.files, current)
    }

    /// Atomically replace the on-disk snapshot. Safe to call repeatedly.
    pub fn save(&self, files: &BTreeMap<String, FileRecord>, sections: &SectionLog) -> Result<()> {
        let snapshot = LedgerSnapshot {
            files: files.clone(),
            sections: sections.clone(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        write_atomic(&self.path, json.as_bytes())
            .with_context(|| format!("Failed to write ledger: {}", self.path.display()))
    }
}

/// Write through a sibling temp file and rename over the target.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
