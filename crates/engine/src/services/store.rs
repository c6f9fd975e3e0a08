use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::json::{parse_json, JsonError};

use super::atomic_io::{remove_if_exists, write_bytes_atomic};

/// One persisted document, addressed by `(kind, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: String,
    pub key: String,
    pub data: serde_json::Value,
}

impl Record {
    pub fn new(kind: impl Into<String>, key: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            data,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid record {field} '{value}': only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidName { field: &'static str, value: String },
    #[error("failed to {operation} '{path}': {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode record {kind}/{key}: {source}")]
    Encode {
        kind: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("record file '{path}' is corrupt: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: JsonError,
    },
}

/// Narrow storage interface used by higher layers such as player tasks.
pub trait Persistence: Send + Sync {
    fn load(&self, kind: &str, key: &str) -> Result<Option<Record>, StoreError>;
    fn save(&self, record: &Record) -> Result<(), StoreError>;
    /// Returns `false` when nothing was stored under the record's address.
    fn delete(&self, record: &Record) -> Result<bool, StoreError>;
    fn list(&self, kind: &str) -> Result<Vec<Record>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<(String, String), Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Persistence for MemoryStore {
    fn load(&self, kind: &str, key: &str) -> Result<Option<Record>, StoreError> {
        Ok(self
            .records
            .read()
            .get(&(kind.to_string(), key.to_string()))
            .cloned())
    }

    fn save(&self, record: &Record) -> Result<(), StoreError> {
        self.records
            .write()
            .insert((record.kind.clone(), record.key.clone()), record.clone());
        Ok(())
    }

    fn delete(&self, record: &Record) -> Result<bool, StoreError> {
        Ok(self
            .records
            .write()
            .remove(&(record.kind.clone(), record.key.clone()))
            .is_some())
    }

    fn list(&self, kind: &str) -> Result<Vec<Record>, StoreError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect())
    }
}

/// One pretty-printed JSON file per record at `<root>/<kind>/<key>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: &str, key: &str) -> Result<PathBuf, StoreError> {
        validate_name("kind", kind)?;
        validate_name("key", key)?;
        Ok(self.root.join(kind).join(format!("{key}.json")))
    }

    fn read_record(path: &Path) -> Result<Record, StoreError> {
        let raw = fs::read_to_string(path).map_err(|source| StoreError::Io {
            operation: "read",
            path: path.to_path_buf(),
            source,
        })?;
        parse_json::<Record>(&raw, "record").map_err(|source| StoreError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Persistence for JsonFileStore {
    fn load(&self, kind: &str, key: &str) -> Result<Option<Record>, StoreError> {
        let path = self.record_path(kind, key)?;
        if !path.is_file() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    fn save(&self, record: &Record) -> Result<(), StoreError> {
        let path = self.record_path(&record.kind, &record.key)?;
        let bytes = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Encode {
            kind: record.kind.clone(),
            key: record.key.clone(),
            source,
        })?;
        write_bytes_atomic(&path, &bytes).map_err(|source| StoreError::Io {
            operation: "write",
            path: path.clone(),
            source,
        })?;
        debug!(kind = %record.kind, key = %record.key, "record_saved");
        Ok(())
    }

    fn delete(&self, record: &Record) -> Result<bool, StoreError> {
        let path = self.record_path(&record.kind, &record.key)?;
        remove_if_exists(&path).map_err(|source| StoreError::Io {
            operation: "delete",
            path,
            source,
        })
    }

    fn list(&self, kind: &str) -> Result<Vec<Record>, StoreError> {
        validate_name("kind", kind)?;
        let dir = self.root.join(kind);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    operation: "list",
                    path: dir,
                    source,
                })
            }
        };

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                operation: "list",
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::read_record(&path) {
                Ok(record) => records.push(record),
                Err(err) => warn!(error = %err, "record_skipped"),
            }
        }
        Ok(records)
    }
}

fn validate_name(field: &'static str, value: &str) -> Result<(), StoreError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName {
            field,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn sample(key: &str, progress: u32) -> Record {
        Record::new("kill_task", key, json!({ "progress": progress }))
    }

    #[test]
    fn file_store_saves_loads_and_deletes() {
        let dir = TempDir::new().expect("temp dir");
        let store = JsonFileStore::new(dir.path());
        let record = sample("aria", 2);

        store.save(&record).expect("save");
        let loaded = store.load("kill_task", "aria").expect("load");
        assert_eq!(loaded, Some(record.clone()));

        assert!(store.delete(&record).expect("delete"));
        assert!(!store.delete(&record).expect("delete again"));
        assert_eq!(store.load("kill_task", "aria").expect("load"), None);
    }

    #[test]
    fn file_store_lists_kind_and_skips_corrupt_files() {
        let dir = TempDir::new().expect("temp dir");
        let store = JsonFileStore::new(dir.path());
        store.save(&sample("b", 1)).expect("save");
        store.save(&sample("a", 0)).expect("save");
        fs::write(dir.path().join("kill_task").join("broken.json"), "{").expect("write");

        let keys: Vec<String> = store
            .list("kill_task")
            .expect("list")
            .into_iter()
            .map(|record| record.key)
            .collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert!(store.list("missing_kind").expect("list").is_empty());
    }

    #[test]
    fn corrupt_record_reports_decode_error() {
        let dir = TempDir::new().expect("temp dir");
        let store = JsonFileStore::new(dir.path());
        fs::create_dir_all(dir.path().join("kill_task")).expect("mkdir");
        fs::write(
            dir.path().join("kill_task").join("aria.json"),
            r#"{"kind":"kill_task","key":7,"data":null}"#,
        )
        .expect("write");

        let err = store.load("kill_task", "aria").expect_err("should fail");
        assert!(matches!(err, StoreError::Decode { .. }));
        assert!(err.to_string().contains("at key"));
    }

    #[test]
    fn path_traversal_names_are_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let store = JsonFileStore::new(dir.path());
        let err = store.load("kill_task", "../escape").expect_err("should fail");
        assert!(matches!(err, StoreError::InvalidName { field: "key", .. }));
    }

    #[test]
    fn memory_store_round_trips_by_address() {
        let store = MemoryStore::new();
        store.save(&sample("aria", 1)).expect("save");
        store.save(&sample("aria", 3)).expect("overwrite");
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.load("kill_task", "aria").expect("load").map(|r| r.data),
            Some(json!({ "progress": 3 }))
        );
        assert!(store.delete(&sample("aria", 0)).expect("delete"));
        assert!(store.is_empty());
    }
}
