//! Persistent "last completed position" per query or run namespace.
//!
//! A page checkpoint `p` means pages `1..=p` have been written to the output;
//! resuming re-fetches page `p` and relies on the seen-set to drop the
//! duplicates. An index checkpoint `i` means input rows `0..i` are done.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9]+").unwrap());

/// Longest label kept in a checkpoint key before the hash suffix
const MAX_LABEL_LEN: usize = 80;

/// Replace every run of non-alphanumeric characters with `_`.
pub fn sanitize_label(text: &str) -> String {
    UNSAFE_CHARS.replace_all(text.trim(), "_").trim_matches('_').to_string()
}

/// Deterministic checkpoint key for a full query text.
///
/// The readable label alone can collide (`a b` vs `a_b`), so a short SHA-256
/// prefix of the exact query is appended.
pub fn checkpoint_key(query: &str) -> String {
    let mut label = sanitize_label(query);
    label.truncate(MAX_LABEL_LEN);

    let digest = Sha256::digest(query.as_bytes());
    let hash: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();

    if label.is_empty() {
        hash
    } else {
        format!("{}-{}", label, hash)
    }
}

/// Which JSON field a store reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointField {
    /// `{"last_page": n}`
    LastPage,
    /// `{"last_processed_index": n}`
    LastProcessedIndex,
}

impl CheckpointField {
    fn name(&self) -> &'static str {
        match self {
            CheckpointField::LastPage => "last_page",
            CheckpointField::LastProcessedIndex => "last_processed_index",
        }
    }
}

/// Key → last completed position
pub trait CheckpointStore {
    /// Stored position, or `None` when there is no usable prior progress.
    fn load(&self, key: &str) -> Option<u64>;

    fn save(&mut self, key: &str, position: u64) -> Result<()>;

    fn clear(&mut self, key: &str) -> Result<()>;
}

/// One JSON file per key inside a progress directory, overwritten on save.
pub struct JsonCheckpointStore {
    dir: PathBuf,
    field: CheckpointField,
}

impl JsonCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, field: CheckpointField) -> Self {
        Self { dir: dir.into(), field }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}_progress.json", key))
    }

    fn read(&self, path: &Path) -> Option<u64> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable checkpoint, starting over");
                return None;
            }
        };

        let value: serde_json::Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt checkpoint, starting over");
                return None;
            }
        };

        let position = value.get(self.field.name()).and_then(|v| v.as_u64());
        if position.is_none() {
            warn!(
                path = %path.display(),
                field = self.field.name(),
                "checkpoint has no usable position, starting over"
            );
        }
        position
    }
}

impl CheckpointStore for JsonCheckpointStore {
    fn load(&self, key: &str) -> Option<u64> {
        self.read(&self.path_for(key))
    }

    fn save(&mut self, key: &str, position: u64) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create progress directory: {}", self.dir.display()))?;

        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let mut body = serde_json::Map::new();
        body.insert(self.field.name().to_string(), position.into());

        fs::write(&tmp, serde_json::to_string_pretty(&body)?)
            .with_context(|| format!("Failed to write checkpoint: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace checkpoint: {}", path.display()))?;
        Ok(())
    }

    fn clear(&mut self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove checkpoint: {}", path.display())),
        }
    }
}

/// In-memory store for tests
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct MemoryCheckpointStore {
    positions: std::collections::HashMap<String, u64>,
}

#[cfg(test)]
impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, key: &str) -> Option<u64> {
        self.positions.get(key).copied()
    }

    fn save(&mut self, key: &str, position: u64) -> Result<()> {
        self.positions.insert(key.to_string(), position);
        Ok(())
    }

    fn clear(&mut self, key: &str) -> Result<()> {
        self.positions.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("ClusterPolicy in:file extension:yaml"), "ClusterPolicy_in_file_extension_yaml");
        assert_eq!(sanitize_label("rego"), "rego");
        assert_eq!(sanitize_label("  \"com.pulumi\" "), "com_pulumi");
    }

    #[test]
    fn test_checkpoint_key_is_deterministic() {
        let q = "extension:rego size:10..29";
        assert_eq!(checkpoint_key(q), checkpoint_key(q));
        assert!(checkpoint_key(q).starts_with("extension_rego_size_10_29-"));
    }

    #[test]
    fn test_checkpoint_key_distinguishes_similar_queries() {
        // same sanitized label, different query text
        assert_ne!(checkpoint_key("a b"), checkpoint_key("a_b"));
        assert_ne!(
            checkpoint_key("extension:rego size:0..9"),
            checkpoint_key("extension:rego size:10..29")
        );
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonCheckpointStore::new(dir.path(), CheckpointField::LastPage);

        assert_eq!(store.load("q"), None);
        store.save("q", 3).unwrap();
        assert_eq!(store.load("q"), Some(3));
        store.save("q", 4).unwrap();
        assert_eq!(store.load("q"), Some(4));

        let raw = fs::read_to_string(store.path_for("q")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["last_page"], 4);

        store.clear("q").unwrap();
        assert_eq!(store.load("q"), None);
        store.clear("q").unwrap();
    }

    #[test]
    fn test_json_store_index_field() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonCheckpointStore::new(dir.path(), CheckpointField::LastProcessedIndex);
        store.save("enrich", 17).unwrap();

        let raw = fs::read_to_string(store.path_for("enrich")).unwrap();
        assert!(raw.contains("last_processed_index"));
        assert_eq!(store.load("enrich"), Some(17));
    }

    #[test]
    fn test_corrupt_checkpoint_means_no_progress() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path(), CheckpointField::LastPage);

        fs::write(store.path_for("broken"), "{not json").unwrap();
        assert_eq!(store.load("broken"), None);

        fs::write(store.path_for("wrong_field"), r#"{"last_processed_index": 5}"#).unwrap();
        assert_eq!(store.load("wrong_field"), None);
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryCheckpointStore::new();
        store.save("a", 1).unwrap();
        assert_eq!(store.load("a"), Some(1));
        store.clear("a").unwrap();
        assert_eq!(store.load("a"), None);
    }
}
