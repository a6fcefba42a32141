//! File System Persistence
//!
//! Information Hiding:
//! - File layout and filename encoding hidden from users
//! - Directory structure management hidden behind the adapter trait
//! - Writes go through a temp file and rename so a crash never leaves a
//!   half-written entry behind
//!
//! Layout: `{base}/sessions/{session}.json` and
//! `{base}/messages/{session}/{message}.json`.

use super::keys::{PersistKey, MESSAGE_PREFIX, SESSION_PREFIX};
use super::{PersistResult, PersistenceAdapter};
use crate::core::{MessageId, SessionId};
use crate::error::PersistenceError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

const SESSIONS_DIR: &str = "sessions";
const MESSAGES_DIR: &str = "messages";
const EXTENSION: &str = "json";

pub struct FileSystemPersistence {
    base_path: PathBuf,
}

impl FileSystemPersistence {
    pub async fn new(base_path: PathBuf) -> PersistResult<Self> {
        for dir in [SESSIONS_DIR, MESSAGES_DIR] {
            let path = base_path.join(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| PersistenceError::io(&path, e))?;
        }

        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn path_for(&self, key: &str) -> PersistResult<PathBuf> {
        match PersistKey::parse(key) {
            Some(PersistKey::Session(session_id)) => Ok(self
                .base_path
                .join(SESSIONS_DIR)
                .join(file_name(session_id.as_str()))),
            Some(PersistKey::Message(session_id, message_id)) => Ok(self
                .base_path
                .join(MESSAGES_DIR)
                .join(encode_component(session_id.as_str()))
                .join(file_name(message_id.as_str()))),
            None => Err(PersistenceError::InvalidKey(key.to_string())),
        }
    }

    async fn session_keys(&self) -> PersistResult<Vec<String>> {
        let dir = self.base_path.join(SESSIONS_DIR);
        let mut keys = Vec::new();
        for stem in json_stems(&dir).await? {
            keys.push(PersistKey::Session(SessionId::new(stem)).render());
        }
        Ok(keys)
    }

    async fn message_keys(&self, only_session: Option<&str>) -> PersistResult<Vec<String>> {
        let root = self.base_path.join(MESSAGES_DIR);
        let mut keys = Vec::new();

        let session_dirs = match only_session {
            Some(session) => vec![(session.to_string(), root.join(encode_component(session)))],
            None => {
                let mut dirs = Vec::new();
                let mut entries = match fs::read_dir(&root).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
                    Err(e) => return Err(PersistenceError::io(&root, e)),
                };
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| PersistenceError::io(&root, e))?
                {
                    let path = entry.path();
                    if path.is_dir() {
                        if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
                            dirs.push((decode_component(name), path.clone()));
                        }
                    }
                }
                dirs
            }
        };

        for (session, dir) in session_dirs {
            for stem in json_stems(&dir).await? {
                keys.push(
                    PersistKey::Message(SessionId::new(session.clone()), MessageId::new(stem)).render(),
                );
            }
        }
        Ok(keys)
    }
}

fn file_name(component: &str) -> String {
    format!("{}.{}", encode_component(component), EXTENSION)
}

/// Decoded stems of every `*.json` file in `dir`; a missing dir is empty
async fn json_stems(dir: &Path) -> PersistResult<Vec<String>> {
    let mut stems = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(stems),
        Err(e) => return Err(PersistenceError::io(dir, e)),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PersistenceError::io(dir, e))?
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some(EXTENSION) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                stems.push(decode_component(stem));
            }
        }
    }
    Ok(stems)
}

/// Percent-encode anything that is not safe in a file name
fn encode_component(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

fn decode_component(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                decoded.push(value);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

#[async_trait]
impl PersistenceAdapter for FileSystemPersistence {
    async fn get(&self, key: &str) -> PersistResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::io(&path, e)),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> PersistResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistenceError::io(parent, e))?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)
            .await
            .map_err(|e| PersistenceError::io(&tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| PersistenceError::io(&path, e))?;

        tracing::trace!("[FileSystemPersistence] Wrote '{}' to {:?}", key, path);
        Ok(())
    }

    async fn delete(&self, key: &str) -> PersistResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::trace!("[FileSystemPersistence] Deleted '{}' at {:?}", key, path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::trace!("[FileSystemPersistence] '{}' does not exist, nothing to delete", key);
            }
            Err(e) => return Err(PersistenceError::io(&path, e)),
        }

        // drop the per-session message directory once it is empty
        if let Some(PersistKey::Message(..)) = PersistKey::parse(key) {
            if let Some(parent) = path.parent() {
                let _ = fs::remove_dir(parent).await;
            }
        }
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> PersistResult<Vec<String>> {
        let mut keys = Vec::new();

        if SESSION_PREFIX.starts_with(prefix) || prefix.starts_with(SESSION_PREFIX) {
            keys.extend(self.session_keys().await?);
        }

        if MESSAGE_PREFIX.starts_with(prefix) {
            keys.extend(self.message_keys(None).await?);
        } else if let Some(rest) = prefix.strip_prefix(MESSAGE_PREFIX) {
            // narrow the scan to one session directory when the prefix names it
            match rest.split_once(':') {
                Some((session, _)) => keys.extend(self.message_keys(Some(session)).await?),
                None => keys.extend(self.message_keys(None).await?),
            }
        }

        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        tracing::debug!("[FileSystemPersistence] Listed {} keys for '{}'", keys.len(), prefix);
        Ok(keys)
    }

    async fn estimate_usage(&self) -> PersistResult<u64> {
        let mut total = 0u64;
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(PersistenceError::io(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| PersistenceError::io(&dir, e))?
            {
                let metadata = entry
                    .metadata()
                    .await
                    .map_err(|e| PersistenceError::io(entry.path(), e))?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                } else {
                    total += metadata.len();
                }
            }
        }
        Ok(total)
    }

    async fn exists(&self, key: &str) -> PersistResult<bool> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }
}
