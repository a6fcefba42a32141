//! Server-pushed stream events
//!
//! Event kinds are a closed set: adding one is a compile-time-checked change
//! everywhere the reconciler and the cache match on them.

use super::types::{MessageContent, MessageEntry, MessageId, SessionId, StreamState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_ROLE: &str = "assistant";

/// One item of a session's event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Update addressed to a single message
    Message(MessageEvent),
    /// Initial history has been fully delivered
    BackfillComplete {
        #[serde(default)]
        resume_token: Option<String>,
    },
    /// Stream-level cursor the source can resume from
    Checkpoint { resume_token: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub message_id: MessageId,
    pub sequence_number: u64,
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub kind: MessageEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageEventKind {
    /// Append text to the message body
    Delta { text: String },
    /// Replace the state of one tool call
    ToolUpdate { tool_call_id: String, state: Value },
    /// No further deltas will follow
    Complete,
    /// Full authoritative content, as returned by a resync
    Snapshot {
        content: MessageContent,
        stream_state: StreamState,
    },
}

impl MessageEventKind {
    /// Whether applying this event requires its predecessor revision to be present
    pub fn is_order_sensitive(&self) -> bool {
        match self {
            MessageEventKind::Delta { .. }
            | MessageEventKind::ToolUpdate { .. }
            | MessageEventKind::Complete => true,
            MessageEventKind::Snapshot { .. } => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MessageEventKind::Delta { .. } => "delta",
            MessageEventKind::ToolUpdate { .. } => "tool_update",
            MessageEventKind::Complete => "complete",
            MessageEventKind::Snapshot { .. } => "snapshot",
        }
    }
}

impl MessageEvent {
    pub fn delta(
        message_id: impl Into<MessageId>,
        sequence_number: u64,
        revision: u64,
        text: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            sequence_number,
            revision,
            role: None,
            kind: MessageEventKind::Delta { text: text.into() },
        }
    }

    pub fn complete(message_id: impl Into<MessageId>, sequence_number: u64, revision: u64) -> Self {
        Self {
            message_id: message_id.into(),
            sequence_number,
            revision,
            role: None,
            kind: MessageEventKind::Complete,
        }
    }

    pub fn tool_update(
        message_id: impl Into<MessageId>,
        sequence_number: u64,
        revision: u64,
        tool_call_id: impl Into<String>,
        state: Value,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            sequence_number,
            revision,
            role: None,
            kind: MessageEventKind::ToolUpdate {
                tool_call_id: tool_call_id.into(),
                state,
            },
        }
    }

    pub fn snapshot(
        message_id: impl Into<MessageId>,
        sequence_number: u64,
        revision: u64,
        content: MessageContent,
        stream_state: StreamState,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            sequence_number,
            revision,
            role: None,
            kind: MessageEventKind::Snapshot {
                content,
                stream_state,
            },
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Build the entry this event creates when its message is not yet cached
    pub fn new_entry(&self, session_id: &SessionId) -> MessageEntry {
        MessageEntry::new(
            session_id.clone(),
            self.message_id.clone(),
            self.sequence_number,
            self.role.as_deref().unwrap_or(DEFAULT_ROLE),
        )
    }

    /// Merge this event into `entry`. Callers are responsible for the revision guard.
    pub fn apply_to(&self, entry: &mut MessageEntry) {
        if let Some(role) = &self.role {
            entry.role = role.clone();
        }

        match &self.kind {
            MessageEventKind::Delta { text } => {
                entry.content.text.push_str(text);
                if entry.stream_state != StreamState::Complete {
                    entry.stream_state = StreamState::Streaming;
                }
            }
            MessageEventKind::ToolUpdate { tool_call_id, state } => {
                entry.content.tools.insert(tool_call_id.clone(), state.clone());
                if entry.stream_state == StreamState::Pending {
                    entry.stream_state = StreamState::Streaming;
                }
            }
            MessageEventKind::Complete => {
                entry.stream_state = StreamState::Complete;
            }
            MessageEventKind::Snapshot {
                content,
                stream_state,
            } => {
                entry.content = content.clone();
                entry.stream_state = *stream_state;
            }
        }

        entry.revision = self.revision;
    }
}

/// Where a reconnecting reconciler asks the source to continue from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeCursor {
    /// Opaque stream-level token, when the source issued one
    pub token: Option<String>,
    /// Last applied revision per message
    pub revisions: BTreeMap<MessageId, u64>,
}

impl ResumeCursor {
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.revisions.is_empty()
    }
}
