//! Model catalog: GGUF models the user has added, persisted as one JSON list.
//!
//! The catalog file is rewritten after every add and remove. An empty catalog
//! is still written as `{"models": []}` so disk and memory never disagree.

use super::file_types::weight_format_label;
use super::gguf::{self, GgufHeader};
use crate::persist::{self, PersistError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const FIELD_UNKNOWN: &str = "Unknown";
pub const FIELD_ERROR: &str = "Error";

/// One cataloged model. Derived fields are display strings: the header value,
/// `Unknown` when the key is absent, or `Error` when the header is unreadable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub path: PathBuf,
    pub name: String,
    pub parameters: String,
    pub weights: String,
    pub layers: String,
}

impl ModelEntry {
    /// Numeric layer count, when the header supplied one.
    pub fn layer_count(&self) -> Option<u32> {
        self.layers.trim().parse().ok()
    }

    /// Name for lists: the header name, else the file stem.
    pub fn display_name(&self) -> String {
        if self.name != FIELD_UNKNOWN && self.name != FIELD_ERROR && !self.name.is_empty() {
            return self.name.clone();
        }
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    fn from_header(path: &Path, header: &GgufHeader) -> Self {
        let text = |v: Option<&gguf::GgufValue>| {
            v.and_then(|v| v.to_text())
                .unwrap_or_else(|| FIELD_UNKNOWN.to_string())
        };

        let weights = match header.get("general.file_type") {
            Some(v) => match v.to_u64() {
                Some(code) => weight_format_label(code),
                None => format!("Unknown ({})", v.to_text().unwrap_or_default()),
            },
            None => FIELD_UNKNOWN.to_string(),
        };

        Self {
            path: path.to_path_buf(),
            name: text(header.get("general.name")),
            parameters: text(header.get("general.size_label")),
            weights,
            layers: text(header.find_suffix("block_count")),
        }
    }

    fn unreadable(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            name: FIELD_ERROR.to_string(),
            parameters: FIELD_ERROR.to_string(),
            weights: FIELD_ERROR.to_string(),
            layers: FIELD_ERROR.to_string(),
        }
    }
}

/// Scan a GGUF file into a catalog entry. Never fails: unreadable or corrupt
/// files produce an entry whose derived fields are all `Error`.
pub fn scan_model(path: &Path) -> ModelEntry {
    match gguf::read_header(path) {
        Ok(header) => {
            let entry = ModelEntry::from_header(path, &header);
            log::info!(
                "[CATALOG] Scanned {}: {} / {} / {} / {} layers",
                path.display(),
                entry.name,
                entry.parameters,
                entry.weights,
                entry.layers
            );
            entry
        }
        Err(e) => {
            log::warn!("[CATALOG] Unreadable model header {}: {}", path.display(), e);
            ModelEntry::unreadable(path)
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to persist model catalog: {0}")]
    Persist(#[from] PersistError),
}

/// In-memory catalog mirrored to a JSON file.
#[derive(Debug)]
pub struct ModelCatalog {
    file: PathBuf,
    entries: Vec<ModelEntry>,
}

impl ModelCatalog {
    /// Load the catalog from `file`. A missing or corrupt file yields an empty
    /// catalog (corrupt files are rewritten empty).
    pub fn load(file: &Path) -> Self {
        let entries = match persist::read_json::<CatalogDocument>(file) {
            Ok(Some(doc)) => dedup_by_path(doc.models),
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("[CATALOG] {} — starting with an empty catalog", e);
                let empty = Self {
                    file: file.to_path_buf(),
                    entries: Vec::new(),
                };
                if let Err(e) = empty.save() {
                    log::error!("[CATALOG] Could not reset catalog file: {}", e);
                }
                return empty;
            }
        };

        log::info!("[CATALOG] Loaded {} model(s) from {}", entries.len(), file.display());
        Self {
            file: file.to_path_buf(),
            entries,
        }
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn get(&self, path: &Path) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Add an entry, replacing any existing entry for the same path, and
    /// rewrite the catalog file.
    pub fn add_entry(&mut self, entry: ModelEntry) -> Result<(), CatalogError> {
        match self.entries.iter_mut().find(|e| e.path == entry.path) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self.save()
    }

    /// Remove the entry for `path` and rewrite the catalog file.
    pub fn remove_entry(&mut self, path: &Path) -> Result<Option<ModelEntry>, CatalogError> {
        let removed = self
            .entries
            .iter()
            .position(|e| e.path == path)
            .map(|idx| self.entries.remove(idx));
        self.save()?;
        Ok(removed)
    }

    fn save(&self) -> Result<(), CatalogError> {
        let doc = CatalogDocument {
            models: self.entries.clone(),
        };
        persist::write_json(&self.file, &doc)?;
        Ok(())
    }
}

fn dedup_by_path(models: Vec<ModelEntry>) -> Vec<ModelEntry> {
    let mut out: Vec<ModelEntry> = Vec::with_capacity(models.len());
    for m in models {
        match out.iter_mut().find(|e| e.path == m.path) {
            Some(existing) => *existing = m,
            None => out.push(m),
        }
    }
    out
}
