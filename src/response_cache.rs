//! Response cache keyed by a digest of the exact request.
//!
//! Two requests share an entry iff their serialized payloads (model,
//! ordered messages, temperature, max tokens) are byte-identical. Entries
//! are never pruned. The map sits behind one mutex that is only held for
//! in-memory access; concurrent identical misses may both reach the
//! service.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::ledger::{sha256_hex, write_atomic};
use crate::llm::ChatRequest;

pub const CACHE_FILE: &str = "llm_cache.json";

/// Stable key for a request.
pub fn request_key(request: &ChatRequest) -> String {
    // Serializing a struct of strings and numbers cannot fail.
    let payload = serde_json::to_vec(request).unwrap_or_default();
    sha256_hex(&payload)
}

pub struct ResponseCache {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, String>>,
}

impl ResponseCache {
    /// Load `<cache_dir>/llm_cache.json`; missing or corrupt files yield
    /// an empty cache.
    pub fn open(cache_dir: &Path) -> Self {
        let path = cache_dir.join(CACHE_FILE);
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "response cache unreadable, starting empty: {}", e);
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "response cache unreadable, starting empty: {}", e);
                HashMap::new()
            }
        };
        Self {
            path: Some(path),
            entries: Mutex::new(entries),
        }
    }

    /// A cache that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn put(&self, key: String, text: String) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, text);
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

    /// Persist all entries (sorted, so unchanged caches write identical
    /// bytes). No-op for in-memory caches.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let sorted: BTreeMap<String, String> = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let json = serde_json::to_string(&sorted)?;
        write_atomic(path, json.as_bytes())
            .with_context(|| format!("Failed to write response cache: {}", path.display()))
    }
}
