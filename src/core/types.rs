//! Cache Domain Types
//!
//! Sessions and messages as they live in the local cache. Payload structure
//! (roles, tool states) is opaque here: the protocol layer owns its meaning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(SessionId);
string_id!(MessageId);

/// Per-message streaming progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Pending,
    Streaming,
    Complete,
}

/// Opaque message payload: accumulated text plus tool-call states keyed by call id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, Value>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tools: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub message_id: MessageId,
    pub session_id: SessionId,
    pub sequence_number: u64,
    pub role: String,
    pub content: MessageContent,
    pub stream_state: StreamState,
    pub revision: u64,
    /// Serialized size, refreshed whenever the entry is re-encoded for persistence
    #[serde(default)]
    pub size_bytes: u64,
}

impl MessageEntry {
    pub fn new(
        session_id: SessionId,
        message_id: MessageId,
        sequence_number: u64,
        role: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            session_id,
            sequence_number,
            role: role.into(),
            content: MessageContent::default(),
            stream_state: StreamState::Pending,
            revision: 0,
            size_bytes: 0,
        }
    }

    pub fn with_content(mut self, content: MessageContent) -> Self {
        self.content = content;
        self
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_state(mut self, state: StreamState) -> Self {
        self.stream_state = state;
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_state == StreamState::Streaming
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: SessionId,
    pub last_accessed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Transcript order: always ascending by sequence number
    #[serde(default)]
    pub message_ids: Vec<MessageId>,
    #[serde(default)]
    pub is_fully_cached: bool,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Lowest sequence number still retained after transcript truncation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated_below: Option<u64>,
}

impl SessionEntry {
    pub fn stub(session_id: SessionId, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            session_id,
            last_accessed_at: now,
            created_at: now,
            expires_at: now + ttl,
            message_ids: Vec::new(),
            is_fully_cached: false,
            size_bytes: 0,
            title: None,
            resume_token: None,
            truncated_below: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn meta(&self) -> SessionMeta {
        SessionMeta {
            session_id: self.session_id.clone(),
            title: self.title.clone(),
            last_accessed_at: self.last_accessed_at,
            created_at: self.created_at,
            expires_at: self.expires_at,
            message_count: self.message_ids.len(),
            is_fully_cached: self.is_fully_cached,
            size_bytes: self.size_bytes,
        }
    }
}

/// Read-only session view handed to UI stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: SessionId,
    pub title: Option<String>,
    pub last_accessed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub message_count: usize,
    pub is_fully_cached: bool,
    pub size_bytes: u64,
}

/// Reconciler lifecycle as reported to the cache and to snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerState {
    Idle,
    Backfilling,
    Live,
    Reconnecting,
    Closed,
    Failed,
}

impl ReconcilerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReconcilerState::Closed | ReconcilerState::Failed)
    }
}

impl fmt::Display for ReconcilerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReconcilerState::Idle => "idle",
            ReconcilerState::Backfilling => "backfilling",
            ReconcilerState::Live => "live",
            ReconcilerState::Reconnecting => "reconnecting",
            ReconcilerState::Closed => "closed",
            ReconcilerState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Everything a UI needs to render one session
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub session: Option<SessionMeta>,
    pub messages: Vec<MessageEntry>,
    pub is_stale: bool,
    pub stream_state: Option<ReconcilerState>,
}

impl Snapshot {
    pub fn absent() -> Self {
        Self {
            session: None,
            messages: Vec::new(),
            is_stale: false,
            stream_state: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_expiry() {
        let now = Utc::now();
        let stub = SessionEntry::stub("s1".into(), now, chrono::Duration::days(7));
        assert!(!stub.is_expired(now));
        assert!(stub.is_expired(now + chrono::Duration::days(7)));
        assert!(!stub.is_fully_cached);
    }

    #[test]
    fn test_session_entry_tolerates_missing_optional_fields() {
        let json = r#"{
            "session_id": "s1",
            "last_accessed_at": "2026-01-01T00:00:00Z",
            "created_at": "2026-01-01T00:00:00Z",
            "expires_at": "2026-01-08T00:00:00Z"
        }"#;
        let entry: SessionEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.session_id.as_str(), "s1");
        assert!(entry.message_ids.is_empty());
        assert!(entry.resume_token.is_none());
    }
}
