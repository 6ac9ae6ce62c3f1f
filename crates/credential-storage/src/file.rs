//! File-backed storage.
//!
//! All entries live in a single JSON object on disk. Reads always go to disk,
//! so no in-process copy is ever the source of truth. Writes rewrite the whole
//! document through a temporary file and a rename; the last writer wins.

use crate::{CredentialBackend, StorageError, StorageResult, WriteBatch, WriteOp};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

type Document = BTreeMap<String, String>;

/// Backend persisting every key in one JSON document.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> StorageResult<Document> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Document::new()),
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(Document::new());
        }

        serde_json::from_str(&content).map_err(|e| {
            StorageError::Encoding(format!(
                "credential file {} is not valid JSON: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn write_document(&self, document: &Document) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_vec_pretty(document)
            .map_err(|e| StorageError::Encoding(e.to_string()))?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        restrict_permissions(&tmp_path)?;
        std::fs::rename(&tmp_path, &self.path)?;

        debug!(path = %self.path.display(), entries = document.len(), "Credential file written");
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> StorageResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> StorageResult<()> {
    Ok(())
}

impl CredentialBackend for FileBackend {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.read_document()?.get(key).cloned())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.read_document()?.into_keys().collect())
    }

    fn apply(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| StorageError::Backend(format!("file backend lock poisoned: {}", e)))?;

        let mut document = match self.read_document() {
            Ok(document) => document,
            Err(StorageError::Encoding(reason)) => {
                warn!(%reason, "Discarding unreadable credential file");
                Document::new()
            }
            Err(e) => return Err(e),
        };

        for op in batch.into_ops() {
            match op {
                WriteOp::Set { key, value } => {
                    document.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    document.remove(&key);
                }
            }
        }

        self.write_document(&document)
    }
}
