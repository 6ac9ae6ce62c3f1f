//! In-memory backend.

use crate::{CredentialBackend, StorageError, StorageResult, WriteBatch, WriteOp};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Volatile backend. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<BTreeMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.data
            .lock()
            .map_err(|e| StorageError::Backend(format!("memory backend lock poisoned: {}", e)))
    }
}

impl CredentialBackend for MemoryBackend {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn apply(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut data = self.lock()?;
        for op in batch.into_ops() {
            match op {
                WriteOp::Set { key, value } => {
                    data.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
