//! Persistent knowledge base of prior linkage decisions.
//!
//! Maps `(lens, variation number)` to a pattern number. The store lives in a
//! human-editable JSON file:
//!
//! ```json
//! {"schema_version": 1, "mappings": {"LensX": {"4": 2}}}
//! ```
//!
//! Loading and flushing are explicit. Writes go through a temp file and a
//! rename, and only happen when something changed. Single writer, no locking.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use patternlink_shared::{CorruptStorePolicy, PatternLinkError, Result};

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

type Mappings = BTreeMap<String, BTreeMap<u32, u32>>;

#[derive(Debug, Serialize, Deserialize)]
struct KnowledgeFile {
    schema_version: u32,
    #[serde(default)]
    mappings: Mappings,
}

/// In-memory view of the knowledge file.
#[derive(Debug, Default)]
pub struct KnowledgeStore {
    path: Option<PathBuf>,
    mappings: Mappings,
    dirty: bool,
}

impl KnowledgeStore {
    /// Store with no backing file; `flush` is a no-op.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`. A missing file yields an empty store; a corrupt
    /// file is handled per `policy`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>, policy: CorruptStorePolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("knowledge store not found, starting empty");
                return Ok(Self::empty_at(path));
            }
            Err(e) => {
                let error = PatternLinkError::io(&path, e);
                return Self::degrade(path, policy, error);
            }
        };

        match parse(&content) {
            Ok(mappings) => {
                let entries: usize = mappings.values().map(BTreeMap::len).sum();
                info!(lenses = mappings.len(), entries, "loaded knowledge store");
                Ok(Self {
                    path: Some(path),
                    mappings,
                    dirty: false,
                })
            }
            Err(e) => Self::degrade(path, policy, e),
        }
    }

    fn empty_at(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            mappings: Mappings::new(),
            dirty: false,
        }
    }

    fn degrade(path: PathBuf, policy: CorruptStorePolicy, error: PatternLinkError) -> Result<Self> {
        match policy {
            CorruptStorePolicy::Fail => Err(error),
            CorruptStorePolicy::StartEmpty => {
                warn!(path = %path.display(), error = %error, "knowledge store unreadable, starting empty");
                Ok(Self::empty_at(path))
            }
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Known pattern for `(lens, variation)`.
    pub fn lookup(&self, lens: &str, variation: u32) -> Option<u32> {
        self.mappings.get(lens)?.get(&variation).copied()
    }

    /// Record a decision. Returns whether the store changed.
    pub fn record(&mut self, lens: &str, variation: u32, pattern: u32) -> bool {
        let entries = self.mappings.entry(lens.to_string()).or_default();
        if entries.get(&variation) == Some(&pattern) {
            return false;
        }
        let previous = entries.insert(variation, pattern);
        debug!(lens, variation, pattern, ?previous, "recorded mapping");
        self.dirty = true;
        true
    }

    /// Remove a decision. Returns whether anything was removed.
    pub fn forget(&mut self, lens: &str, variation: u32) -> bool {
        let Some(entries) = self.mappings.get_mut(lens) else {
            return false;
        };
        let removed = entries.remove(&variation).is_some();
        if entries.is_empty() {
            self.mappings.remove(lens);
        }
        if removed {
            debug!(lens, variation, "forgot mapping");
            self.dirty = true;
        }
        removed
    }

    /// Lens identities with at least one mapping, sorted.
    pub fn lenses(&self) -> impl Iterator<Item = &str> {
        self.mappings.keys().map(String::as_str)
    }

    /// All mappings for a lens, keyed by variation number.
    pub fn mapping(&self, lens: &str) -> Option<&BTreeMap<u32, u32>> {
        self.mappings.get(lens)
    }

    /// Total number of stored decisions.
    pub fn len(&self) -> usize {
        self.mappings.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether there are unflushed changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write pending changes. Returns whether the file was written.
    pub fn flush(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let Some(path) = &self.path else {
            self.dirty = false;
            return Ok(false);
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PatternLinkError::io(parent, e))?;
        }
        let file = KnowledgeFile {
            schema_version: SCHEMA_VERSION,
            mappings: self.mappings.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| PatternLinkError::Knowledge(format!("serialize store: {e}")))?;

        let temp = path.with_extension("json.tmp");
        std::fs::write(&temp, json + "\n").map_err(|e| PatternLinkError::io(&temp, e))?;
        std::fs::rename(&temp, path).map_err(|e| PatternLinkError::io(path, e))?;

        info!(path = %path.display(), entries = self.len(), "flushed knowledge store");
        self.dirty = false;
        Ok(true)
    }
}

fn parse(content: &str) -> Result<Mappings> {
    let file: KnowledgeFile = serde_json::from_str(content)
        .map_err(|e| PatternLinkError::Knowledge(format!("invalid knowledge file: {e}")))?;
    if file.schema_version != SCHEMA_VERSION {
        return Err(PatternLinkError::Knowledge(format!(
            "unsupported schema_version {} (expected {SCHEMA_VERSION})",
            file.schema_version
        )));
    }
    let mut mappings = file.mappings;
    for (lens, entries) in mappings.iter_mut() {
        entries.retain(|variation, pattern| {
            let valid = *variation > 0 && *pattern > 0;
            if !valid {
                warn!(lens = %lens, variation = *variation, pattern = *pattern, "dropping invalid mapping");
            }
            valid
        });
    }
    mappings.retain(|_, entries| !entries.is_empty());
    Ok(mappings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("patternlink-kb-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = temp_dir("missing");
        let store = KnowledgeStore::load(dir.join("kb.json"), CorruptStorePolicy::Fail).unwrap();
        assert!(store.is_empty());
        assert!(!store.is_dirty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn record_lookup_flush_reload() {
        let dir = temp_dir("roundtrip");
        let path = dir.join("nested").join("kb.json");
        let mut store = KnowledgeStore::load(&path, CorruptStorePolicy::Fail).unwrap();
        assert!(store.record("LensX", 4, 2));
        assert!(store.record("LensX", 10, 1));
        assert!(store.flush().unwrap());
        assert!(!store.flush().unwrap());

        let reloaded = KnowledgeStore::load(&path, CorruptStorePolicy::Fail).unwrap();
        assert_eq!(reloaded.lookup("LensX", 4), Some(2));
        assert_eq!(reloaded.lookup("LensX", 10), Some(1));
        assert_eq!(reloaded.lookup("LensY", 4), None);

        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["schema_version"], 1);
        assert_eq!(value["mappings"]["LensX"]["4"], 2);
        assert!(text.find("\"4\"").unwrap() < text.find("\"10\"").unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn restating_a_fact_is_noop() {
        let mut store = KnowledgeStore::in_memory();
        assert!(store.record("L", 1, 3));
        store.dirty = false;
        assert!(!store.record("L", 1, 3));
        assert!(!store.is_dirty());
        assert!(store.record("L", 1, 2));
        assert_eq!(store.lookup("L", 1), Some(2));
    }

    #[test]
    fn forget_removes_empty_lenses() {
        let mut store = KnowledgeStore::in_memory();
        store.record("A", 1, 1);
        store.record("B", 2, 1);
        assert!(store.forget("A", 1));
        assert!(!store.forget("A", 1));
        assert_eq!(store.lenses().collect::<Vec<_>>(), vec!["B"]);
        assert_eq!(store.mapping("B").unwrap().get(&2), Some(&1));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn corrupt_file_respects_policy() {
        let dir = temp_dir("corrupt");
        let path = dir.join("kb.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(KnowledgeStore::load(&path, CorruptStorePolicy::Fail).is_err());
        let store = KnowledgeStore::load(&path, CorruptStorePolicy::StartEmpty).unwrap();
        assert!(store.is_empty());
        // Left untouched until the next flush.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unsupported_schema_is_corrupt() {
        let dir = temp_dir("schema");
        let path = dir.join("kb.json");
        std::fs::write(&path, r#"{"schema_version": 9, "mappings": {}}"#).unwrap();
        assert!(matches!(
            KnowledgeStore::load(&path, CorruptStorePolicy::Fail),
            Err(PatternLinkError::Knowledge(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn invalid_entries_are_dropped() {
        let mappings =
            parse(r#"{"schema_version": 1, "mappings": {"L": {"1": 0, "2": 3}, "E": {"0": 1}}}"#)
                .unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings["L"].get(&2), Some(&3));
        assert_eq!(mappings["L"].get(&1), None);
    }

    #[test]
    fn in_memory_flush_is_noop() {
        let mut store = KnowledgeStore::in_memory();
        store.record("L", 1, 1);
        assert!(!store.flush().unwrap());
        assert!(store.path().is_none());
    }
}
