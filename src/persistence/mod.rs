//! Persistence Abstraction
//!
//! Information Hiding:
//! - Storage backend details hidden behind a byte-oriented key-value trait
//! - Allows swapping between memory, filesystem and SQLite without touching the cache
//! - The cache treats every backend as slow, fallible and bounded

use crate::config::{PersistenceBackend, PersistenceConfig};
use crate::error::PersistenceError;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

pub mod filesystem;
pub mod keys;
pub mod memory;
pub mod sqlite;

pub use filesystem::FileSystemPersistence;
pub use keys::{message_key, message_prefix, session_key, PersistKey, MESSAGE_PREFIX, SESSION_PREFIX};
pub use memory::InMemoryPersistence;
pub use sqlite::SqlitePersistence;

pub type PersistResult<T> = Result<T, PersistenceError>;

/// Byte-oriented key-value store with usage accounting
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Read a value; `None` when the key is absent
    async fn get(&self, key: &str) -> PersistResult<Option<Vec<u8>>>;

    /// Insert or overwrite a value
    async fn set(&self, key: &str, value: &[u8]) -> PersistResult<()>;

    /// Remove a value; deleting an absent key succeeds
    async fn delete(&self, key: &str) -> PersistResult<()>;

    /// All keys starting with `prefix`
    async fn list_keys(&self, prefix: &str) -> PersistResult<Vec<String>>;

    /// Approximate bytes currently stored
    async fn estimate_usage(&self) -> PersistResult<u64>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> PersistResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Build the adapter named by the persistence settings
pub async fn open_backend(config: &PersistenceConfig) -> PersistResult<Arc<dyn PersistenceAdapter>> {
    let path = Path::new(&config.path);
    let adapter: Arc<dyn PersistenceAdapter> = match config.backend {
        PersistenceBackend::Memory => Arc::new(InMemoryPersistence::new()),
        PersistenceBackend::Fs => Arc::new(FileSystemPersistence::new(path.to_path_buf()).await?),
        PersistenceBackend::Sqlite => {
            let file = if path.extension().is_some() {
                path.to_path_buf()
            } else {
                path.join("cache.db")
            };
            Arc::new(SqlitePersistence::open(&file)?)
        }
    };
    tracing::debug!("Opened {:?} persistence at {}", config.backend, config.path);
    Ok(adapter)
}
