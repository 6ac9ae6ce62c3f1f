//! Storage trait definitions.

use crate::StorageResult;

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Set { key: String, value: String },
    Delete { key: String },
}

/// Ordered group of mutations applied as one write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Set {
            key: key.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn delete(mut self, key: &str) -> Self {
        self.ops.push(WriteOp::Delete {
            key: key.to_string(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Trait for persistent key/value backends.
pub trait CredentialBackend: Send + Sync {
    /// Retrieve a value
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// All keys currently stored.
    fn keys(&self) -> StorageResult<Vec<String>>;

    /// Apply every operation in the batch as a single write.
    ///
    /// Backends must make the batch visible all at once: a reader never sees
    /// half of it.
    fn apply(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Store a value
    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.apply(WriteBatch::new().set(key, value))
    }

    /// Delete a value, returning whether it existed.
    fn delete(&self, key: &str) -> StorageResult<bool> {
        let existed = self.has(key)?;
        self.apply(WriteBatch::new().delete(key))?;
        Ok(existed)
    }

    /// Delete several keys in one write.
    fn delete_many(&self, keys: &[&str]) -> StorageResult<()> {
        let batch = keys
            .iter()
            .fold(WriteBatch::new(), |batch, key| batch.delete(key));
        self.apply(batch)
    }

    /// Check if a key exists
    fn has(&self, key: &str) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// List all keys that start with a given prefix.
    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .keys()?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}
