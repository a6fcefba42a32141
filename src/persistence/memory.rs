//! In-Memory Persistence
//!
//! Information Hiding:
//! - HashMap storage structure hidden from users
//! - Thread-safe access via RwLock hidden behind async interface
//! - Suitable for testing and ephemeral caches; supports a byte quota and
//!   injected write failures so retry paths can be exercised

use super::{PersistResult, PersistenceAdapter};
use crate::error::PersistenceError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory key-value store; data is lost when the process terminates
#[derive(Clone)]
pub struct InMemoryPersistence {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    quota_bytes: Option<u64>,
    fail_writes: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            quota_bytes: None,
            fail_writes: Arc::new(AtomicBool::new(false)),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    /// Make every subsequent `set`/`delete` fail until switched off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `set` calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn check_writable(&self, key: &str) -> PersistResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Write {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

fn usage_of(entries: &HashMap<String, Vec<u8>>) -> u64 {
    entries
        .iter()
        .map(|(key, value)| (key.len() + value.len()) as u64)
        .sum()
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    async fn get(&self, key: &str) -> PersistResult<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> PersistResult<()> {
        self.check_writable(key)?;
        let mut entries = self.entries.write().await;

        if let Some(quota) = self.quota_bytes {
            let current = usage_of(&entries);
            let replaced = entries
                .get(key)
                .map(|old| (key.len() + old.len()) as u64)
                .unwrap_or(0);
            let needed = (key.len() + value.len()) as u64;
            let available = quota.saturating_sub(current - replaced);
            if needed > available {
                return Err(PersistenceError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    available,
                });
            }
        }

        entries.insert(key.to_string(), value.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        tracing::trace!("[InMemoryPersistence] Set '{}' ({} bytes)", key, value.len());
        Ok(())
    }

    async fn delete(&self, key: &str) -> PersistResult<()> {
        self.check_writable(key)?;
        let mut entries = self.entries.write().await;
        entries.remove(key);
        tracing::trace!("[InMemoryPersistence] Deleted '{}'", key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> PersistResult<Vec<String>> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn estimate_usage(&self) -> PersistResult<u64> {
        let entries = self.entries.read().await;
        Ok(usage_of(&entries))
    }

    async fn exists(&self, key: &str) -> PersistResult<bool> {
        let entries = self.entries.read().await;
        Ok(entries.contains_key(key))
    }
}
