//! Channel Event Source
//!
//! Information Hiding:
//! - Per-session event log and live connection hidden behind the trait
//! - Resume tokens are log offsets; without one, per-message revisions are used
//!
//! Hosts that receive events from their own transport publish them here;
//! tests use it to script disconnects, failed opens and odd deliveries.

use super::{EventSource, EventStream};
use crate::core::{
    MessageEntry, MessageEvent, MessageId, ResumeCursor, SessionId, StreamEvent,
};
use crate::error::SourceError;
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

type Delivery = Result<StreamEvent, SourceError>;

#[derive(Default)]
struct SessionLog {
    events: Vec<MessageEvent>,
    live: Option<UnboundedSender<Delivery>>,
    failing_opens: u32,
    fatal: Option<String>,
    opens: u32,
    last_cursor: Option<ResumeCursor>,
}

impl SessionLog {
    fn token(&self) -> String {
        self.events.len().to_string()
    }

    fn send_live(&mut self, delivery: Delivery) {
        if let Some(live) = &self.live {
            if live.unbounded_send(delivery).is_err() {
                self.live = None;
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct ChannelEventSource {
    sessions: Arc<Mutex<HashMap<SessionId, SessionLog>>>,
}

impl ChannelEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionLog>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an event in history and deliver it to the open connection
    pub fn publish(&self, session_id: &SessionId, event: MessageEvent) {
        let mut sessions = self.lock();
        let log = sessions.entry(session_id.clone()).or_default();
        log.events.push(event.clone());
        let token = log.token();
        log.send_live(Ok(StreamEvent::Message(event)));
        log.send_live(Ok(StreamEvent::Checkpoint { resume_token: token }));
    }

    /// Record history without delivering it (events the client missed)
    pub fn record(&self, session_id: &SessionId, event: MessageEvent) {
        let mut sessions = self.lock();
        sessions.entry(session_id.clone()).or_default().events.push(event);
    }

    /// Deliver a raw event to the open connection without recording it
    pub fn deliver(&self, session_id: &SessionId, event: StreamEvent) -> bool {
        let mut sessions = self.lock();
        match sessions.get_mut(session_id) {
            Some(log) if log.live.is_some() => {
                log.send_live(Ok(event));
                log.live.is_some()
            }
            _ => false,
        }
    }

    /// Drop the open connection with a transient error
    pub fn disconnect(&self, session_id: &SessionId) {
        let mut sessions = self.lock();
        if let Some(log) = sessions.get_mut(session_id) {
            log.send_live(Err(SourceError::Transient("connection reset".to_string())));
            log.live = None;
        }
    }

    /// Make the next `count` opens fail with a transient error
    pub fn fail_next_opens(&self, session_id: &SessionId, count: u32) {
        let mut sessions = self.lock();
        sessions.entry(session_id.clone()).or_default().failing_opens = count;
    }

    /// Make every open fail permanently
    pub fn reject(&self, session_id: &SessionId, reason: impl Into<String>) {
        let mut sessions = self.lock();
        sessions.entry(session_id.clone()).or_default().fatal = Some(reason.into());
    }

    pub fn open_count(&self, session_id: &SessionId) -> u32 {
        self.lock().get(session_id).map(|log| log.opens).unwrap_or(0)
    }

    pub fn last_cursor(&self, session_id: &SessionId) -> Option<ResumeCursor> {
        self.lock().get(session_id).and_then(|log| log.last_cursor.clone())
    }

    pub fn is_connected(&self, session_id: &SessionId) -> bool {
        self.lock()
            .get(session_id)
            .map(|log| log.live.as_ref().is_some_and(|live| !live.is_closed()))
            .unwrap_or(false)
    }
}

/// Events from the log that the cursor has not seen yet
fn replay_from(log: &SessionLog, cursor: Option<&ResumeCursor>) -> Vec<MessageEvent> {
    let Some(cursor) = cursor else {
        return log.events.clone();
    };

    if let Some(offset) = cursor.token.as_deref().and_then(|t| t.parse::<usize>().ok()) {
        return log.events.iter().skip(offset).cloned().collect();
    }

    log.events
        .iter()
        .filter(|event| {
            cursor
                .revisions
                .get(&event.message_id)
                .map(|seen| event.revision > *seen)
                .unwrap_or(true)
        })
        .cloned()
        .collect()
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn open(
        &self,
        session_id: &SessionId,
        cursor: Option<ResumeCursor>,
    ) -> Result<EventStream, SourceError> {
        let mut sessions = self.lock();
        let log = sessions.entry(session_id.clone()).or_default();
        log.opens += 1;
        log.last_cursor = cursor.clone();

        if let Some(reason) = &log.fatal {
            return Err(SourceError::Fatal(reason.clone()));
        }
        if log.failing_opens > 0 {
            log.failing_opens -= 1;
            return Err(SourceError::Transient("connection refused".to_string()));
        }

        let (tx, rx) = unbounded();
        for event in replay_from(log, cursor.as_ref()) {
            let _ = tx.unbounded_send(Ok(StreamEvent::Message(event)));
        }
        let _ = tx.unbounded_send(Ok(StreamEvent::BackfillComplete {
            resume_token: Some(log.token()),
        }));
        log.live = Some(tx);

        tracing::debug!("[ChannelEventSource] Opened session '{}' (open #{})", session_id, log.opens);
        Ok(rx.boxed())
    }

    async fn resync(
        &self,
        session_id: &SessionId,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessageEvent>, SourceError> {
        let sessions = self.lock();
        let Some(log) = sessions.get(session_id) else {
            return Ok(Vec::new());
        };

        let mut folded: HashMap<&MessageId, MessageEntry> = HashMap::new();
        for event in log.events.iter().filter(|e| message_ids.contains(&e.message_id)) {
            let entry = folded
                .entry(&event.message_id)
                .or_insert_with(|| event.new_entry(session_id));
            if event.revision > entry.revision {
                event.apply_to(entry);
            }
        }

        let mut snapshots: Vec<MessageEvent> = folded
            .into_values()
            .map(|entry| {
                MessageEvent::snapshot(
                    entry.message_id.clone(),
                    entry.sequence_number,
                    entry.revision,
                    entry.content.clone(),
                    entry.stream_state,
                )
                .with_role(entry.role.clone())
            })
            .collect();
        snapshots.sort_by_key(|e| e.sequence_number);
        Ok(snapshots)
    }

    async fn close(&self, session_id: &SessionId) {
        let mut sessions = self.lock();
        if let Some(log) = sessions.get_mut(session_id) {
            log.live = None;
        }
    }
}
