//! Error taxonomy
//!
//! Errors stay local to the session or entry that produced them. Only an
//! exhausted reconciler surfaces, and it does so as a stale flag on snapshots.

use crate::core::SessionId;
use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by an `EventSource`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Connection dropped or could not be established; retried with backoff
    #[error("transient network error: {0}")]
    Transient(String),

    /// An open or backfill attempt exceeded its time box
    #[error("attempt timed out after {0}ms")]
    Timeout(u64),

    /// Server sent something that cannot be a valid event
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Unrecoverable (unknown session, revoked access); not retried
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transient(_) | SourceError::Timeout(_))
    }
}

/// Failures reported by a `PersistenceAdapter`
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage quota exceeded writing '{key}' ({needed} bytes, {available} available)")]
    QuotaExceeded {
        key: String,
        needed: u64,
        available: u64,
    },

    #[error("corrupt entry '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("invalid key '{0}'")]
    InvalidKey(String),

    #[error("write failed for '{key}': {reason}")]
    Write { key: String, reason: String },

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

impl PersistenceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures of the cache itself, as seen by callers
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("session '{0}' not found")]
    SessionNotFound(SessionId),

    #[error("invalid session id '{0}': must be non-empty without ':'")]
    InvalidSessionId(String),

    #[error("{0} actor is no longer running")]
    ActorUnavailable(&'static str),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub type CacheResult<T> = Result<T, CacheError>;
