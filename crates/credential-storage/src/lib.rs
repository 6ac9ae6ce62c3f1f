//! Persistent credential storage for the Djombi auth core.
//!
//! This crate provides:
//! - a key/value backend trait with batched, single-pass writes
//! - a file backend that survives restarts (one JSON document, atomic rewrite)
//! - an in-memory backend for tests and ephemeral sessions
//! - [`CredentialStore`], the typed API over the `djombi.auth.` key namespace
//! - [`CacheEntry`], a timestamped payload with a fixed time-to-live

mod cache;
mod file;
mod keys;
mod memory;
mod models;
mod store;
mod traits;

pub use cache::CacheEntry;
pub use file::FileBackend;
pub use keys::StorageKeys;
pub use memory::MemoryBackend;
pub use models::{AuthStatusRecord, PrimaryToken, SecondaryToken, UserIdentity};
pub use store::{CredentialStore, TokenUpdate};
pub use traits::{CredentialBackend, WriteBatch, WriteOp};

use std::path::Path;
use thiserror::Error;

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend-specific failure (lock poisoned, unexpected state)
    #[error("Backend storage error: {0}")]
    Backend(String),

    /// Encoding/decoding error
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Create a credential store persisted at `path`.
pub fn create_file_store(path: impl AsRef<Path>) -> CredentialStore {
    CredentialStore::new(Box::new(FileBackend::new(path.as_ref())))
}
