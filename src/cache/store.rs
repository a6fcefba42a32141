//! Cache Store
//!
//! Information Hiding:
//! - Session/message index structures hidden behind upsert and query methods
//! - Byte accounting maintained incrementally as entries are re-encoded
//! - Persistence is scheduled, not performed: mutations push `PersistOp`s to
//!   an outbox that the owning actor hands to the persistence writer
//!
//! The store is synchronous and has exactly one owner, so every mutation runs
//! to completion before the next one starts.

use super::budgets::{BudgetOverrides, Budgets};
use super::eviction::{self, EvictionReason, MessageUsage, SessionUsage};
use crate::core::{
    Clock, MessageEntry, MessageEvent, MessageId, ReconcilerState, SessionEntry, SessionId,
    SessionMeta, Snapshot,
};
use crate::error::{CacheError, CacheResult};
use crate::persistence::{
    message_key, session_key, PersistKey, PersistenceAdapter, MESSAGE_PREFIX,
    SESSION_PREFIX,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

/// A write or delete the persistence writer should perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOp {
    Put { key: String, bytes: Vec<u8> },
    Delete { key: String },
}

impl PersistOp {
    pub fn key(&self) -> &str {
        match self {
            PersistOp::Put { key, .. } | PersistOp::Delete { key } => key,
        }
    }
}

/// Result of offering a message update to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    /// Revision at or below the stored one; nothing changed
    Stale { current_revision: u64 },
    /// New message below the session's truncation floor; dropped
    BelowTruncationFloor { floor: u64 },
    /// Impossible sequence/revision combination; dropped
    ProtocolViolation(String),
    /// The session was demoted or removed since the writer attached; dropped.
    /// `generation` is the resident slot's current one, if any.
    Invalidated { generation: Option<u64> },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Created | ApplyOutcome::Updated)
    }
}

/// Sequence-number range for `get_messages`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRange {
    pub start: Bound<u64>,
    pub end: Bound<u64>,
}

impl MessageRange {
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    pub fn from_bounds(range: impl RangeBounds<u64>) -> Self {
        Self {
            start: range.start_bound().cloned(),
            end: range.end_bound().cloned(),
        }
    }

    /// Whether `BTreeMap::range` accepts these bounds
    fn is_well_formed(&self) -> bool {
        match (self.start, self.end) {
            (Bound::Included(a), Bound::Included(b)) => a <= b,
            (Bound::Included(a), Bound::Excluded(b))
            | (Bound::Excluded(a), Bound::Included(b))
            | (Bound::Excluded(a), Bound::Excluded(b)) => a < b,
            _ => true,
        }
    }
}

impl Default for MessageRange {
    fn default() -> Self {
        Self::all()
    }
}

/// What one enforcement pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionReport {
    pub expired: Vec<SessionId>,
    pub evicted: Vec<SessionId>,
    pub demoted: Vec<SessionId>,
    pub trimmed_messages: usize,
    pub over_budget_bytes: u64,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty()
            && self.evicted.is_empty()
            && self.demoted.is_empty()
            && self.trimmed_messages == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub sessions: usize,
    pub full_sessions: usize,
    pub messages: usize,
    pub total_bytes: u64,
}

/// What `CacheStore::load` found in persistence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub sessions: usize,
    pub messages: usize,
    pub corrupt_keys: usize,
    pub expired_sessions: usize,
    pub orphaned_keys: usize,
}

#[derive(Debug, Clone)]
struct SessionSlot {
    entry: SessionEntry,
    /// Changes whenever held history is discarded wholesale (demotion, or a
    /// fresh slot after removal)
    generation: u64,
    order: BTreeMap<u64, MessageId>,
    messages: HashMap<MessageId, MessageEntry>,
    meta_bytes: u64,
    message_bytes: u64,
}

impl SessionSlot {
    fn new(entry: SessionEntry, generation: u64) -> Self {
        Self {
            entry,
            generation,
            order: BTreeMap::new(),
            messages: HashMap::new(),
            meta_bytes: 0,
            message_bytes: 0,
        }
    }

    fn sync_message_ids(&mut self) {
        self.entry.message_ids = self.order.values().cloned().collect();
    }

    fn usage(&self) -> SessionUsage {
        SessionUsage {
            session_id: self.entry.session_id.clone(),
            last_accessed_at: self.entry.last_accessed_at,
            expires_at: self.entry.expires_at,
            is_fully_cached: self.entry.is_fully_cached,
            message_count: self.messages.len(),
            size_bytes: self.entry.size_bytes,
            message_bytes: self.message_bytes,
        }
    }

    fn message_usages(&self) -> Vec<MessageUsage> {
        self.order
            .iter()
            .filter_map(|(seq, id)| {
                self.messages.get(id).map(|m| MessageUsage {
                    message_id: id.clone(),
                    sequence_number: *seq,
                    is_streaming: m.is_streaming(),
                    size_bytes: m.size_bytes,
                })
            })
            .collect()
    }
}

pub struct CacheStore {
    sessions: HashMap<SessionId, SessionSlot>,
    stream_states: HashMap<SessionId, ReconcilerState>,
    budgets: Budgets,
    clock: Arc<dyn Clock>,
    total_bytes: u64,
    next_generation: u64,
    outbox: Vec<PersistOp>,
    changed: BTreeSet<SessionId>,
}

fn validate_session_id(session_id: &SessionId) -> CacheResult<()> {
    if session_id.as_str().is_empty() || session_id.as_str().contains(':') {
        return Err(CacheError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

impl CacheStore {
    pub fn new(budgets: Budgets, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: HashMap::new(),
            stream_states: HashMap::new(),
            budgets,
            clock,
            total_bytes: 0,
            next_generation: 1,
            outbox: Vec::new(),
            changed: BTreeSet::new(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn budgets(&self) -> &Budgets {
        &self.budgets
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn issue_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn visible_slot(&self, session_id: &SessionId) -> Option<&SessionSlot> {
        let now = self.now();
        self.sessions
            .get(session_id)
            .filter(|slot| !slot.entry.is_expired(now))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Locally resident session, possibly a stub; expired sessions are invisible
    pub fn get_session(&self, session_id: &SessionId) -> Option<SessionEntry> {
        self.visible_slot(session_id).map(|slot| slot.entry.clone())
    }

    /// Locally held messages in ascending sequence order.
    ///
    /// An empty vector means "session known, nothing held"; an unknown or
    /// expired session is `SessionNotFound`.
    pub fn get_messages(
        &self,
        session_id: &SessionId,
        range: MessageRange,
    ) -> CacheResult<Vec<MessageEntry>> {
        let slot = self
            .visible_slot(session_id)
            .ok_or_else(|| CacheError::SessionNotFound(session_id.clone()))?;

        if !range.is_well_formed() {
            return Ok(Vec::new());
        }

        Ok(slot
            .order
            .range((range.start, range.end))
            .filter_map(|(_, id)| slot.messages.get(id).cloned())
            .collect())
    }

    pub fn get_message(&self, session_id: &SessionId, message_id: &MessageId) -> Option<MessageEntry> {
        self.visible_slot(session_id)
            .and_then(|slot| slot.messages.get(message_id).cloned())
    }

    /// Generation of the resident slot; expired sessions have none
    pub fn generation(&self, session_id: &SessionId) -> Option<u64> {
        self.visible_slot(session_id).map(|slot| slot.generation)
    }

    pub fn stream_state(&self, session_id: &SessionId) -> Option<ReconcilerState> {
        self.stream_states.get(session_id).copied()
    }

    pub fn snapshot(&self, session_id: &SessionId) -> Snapshot {
        let Some(slot) = self.visible_slot(session_id) else {
            return Snapshot::absent();
        };
        let stream_state = self.stream_state(session_id);

        Snapshot {
            session: Some(slot.entry.meta()),
            messages: slot
                .order
                .values()
                .filter_map(|id| slot.messages.get(id).cloned())
                .collect(),
            is_stale: stream_state == Some(ReconcilerState::Failed),
            stream_state,
        }
    }

    /// History list, most recently accessed first; stubs included
    pub fn list_sessions(&self) -> Vec<SessionMeta> {
        let now = self.now();
        let mut metas: Vec<SessionMeta> = self
            .sessions
            .values()
            .filter(|slot| !slot.entry.is_expired(now))
            .map(|slot| slot.entry.meta())
            .collect();
        metas.sort_by(|a, b| {
            b.last_accessed_at
                .cmp(&a.last_accessed_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        metas
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            sessions: self.sessions.len(),
            full_sessions: self
                .sessions
                .values()
                .filter(|slot| slot.entry.is_fully_cached)
                .count(),
            messages: self.sessions.values().map(|slot| slot.messages.len()).sum(),
            total_bytes: self.total_bytes,
        }
    }

    // ------------------------------------------------------------------
    // Outbox
    // ------------------------------------------------------------------

    pub fn drain_outbox(&mut self) -> Vec<PersistOp> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_changed(&mut self) -> Vec<SessionId> {
        std::mem::take(&mut self.changed).into_iter().collect()
    }

    fn schedule_session_write(&mut self, session_id: &SessionId) {
        let Some(slot) = self.sessions.get_mut(session_id) else {
            return;
        };
        match serde_json::to_vec(&slot.entry) {
            Ok(bytes) => {
                slot.meta_bytes = bytes.len() as u64;
                self.outbox.push(PersistOp::Put {
                    key: session_key(session_id),
                    bytes,
                });
            }
            Err(e) => {
                tracing::error!("[CacheStore] Failed to encode session '{}': {}", session_id, e);
            }
        }
        self.account(session_id);
    }

    fn schedule_message_write(&mut self, session_id: &SessionId, message_id: &MessageId) {
        let Some(slot) = self.sessions.get_mut(session_id) else {
            return;
        };
        let Some(message) = slot.messages.get_mut(message_id) else {
            return;
        };
        match serde_json::to_vec(&*message) {
            Ok(bytes) => {
                let new_size = bytes.len() as u64;
                slot.message_bytes = slot.message_bytes.saturating_sub(message.size_bytes) + new_size;
                message.size_bytes = new_size;
                self.outbox.push(PersistOp::Put {
                    key: message_key(session_id, message_id),
                    bytes,
                });
            }
            Err(e) => {
                tracing::error!(
                    "[CacheStore] Failed to encode message '{}' of session '{}': {}",
                    message_id,
                    session_id,
                    e
                );
            }
        }
        self.account(session_id);
    }

    /// Refresh a session's size and the running total after its parts changed
    fn account(&mut self, session_id: &SessionId) {
        if let Some(slot) = self.sessions.get_mut(session_id) {
            let new_size = slot.meta_bytes + slot.message_bytes;
            self.total_bytes = self.total_bytes.saturating_sub(slot.entry.size_bytes) + new_size;
            slot.entry.size_bytes = new_size;
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Refresh `last_accessed_at` without changing content; never evicts
    pub fn touch(&mut self, session_id: &SessionId) -> bool {
        let now = self.now();
        match self.sessions.get_mut(session_id) {
            Some(slot) if !slot.entry.is_expired(now) => {
                slot.entry.last_accessed_at = now;
                self.schedule_session_write(session_id);
                true
            }
            _ => false,
        }
    }

    /// Create a stub on miss. Returns `true` when a new stub was created.
    pub fn ensure_stub(&mut self, session_id: &SessionId) -> CacheResult<bool> {
        validate_session_id(session_id)?;
        let now = self.now();

        if let Some(slot) = self.sessions.get(session_id) {
            if !slot.entry.is_expired(now) {
                self.touch(session_id);
                return Ok(false);
            }
            self.remove_session(session_id, EvictionReason::Expired);
        }

        let stub = SessionEntry::stub(session_id.clone(), now, self.budgets.ttl);
        let generation = self.issue_generation();
        self.sessions
            .insert(session_id.clone(), SessionSlot::new(stub, generation));
        tracing::debug!("[CacheStore] Created stub for session '{}'", session_id);
        self.schedule_session_write(session_id);
        self.changed.insert(session_id.clone());
        self.enforce_budgets(Some(session_id));
        Ok(true)
    }

    /// Idempotent metadata upsert; held messages are kept
    pub fn put_session(&mut self, entry: SessionEntry) -> CacheResult<()> {
        validate_session_id(&entry.session_id)?;
        let session_id = entry.session_id.clone();

        match self.sessions.get_mut(&session_id) {
            Some(slot) => {
                let SessionEntry {
                    last_accessed_at,
                    created_at,
                    expires_at,
                    is_fully_cached,
                    title,
                    resume_token,
                    ..
                } = entry;
                slot.entry.last_accessed_at = slot.entry.last_accessed_at.max(last_accessed_at);
                slot.entry.created_at = created_at;
                slot.entry.expires_at = expires_at;
                slot.entry.is_fully_cached = is_fully_cached;
                slot.entry.title = title;
                slot.entry.resume_token = resume_token;
            }
            None => {
                let generation = self.issue_generation();
                let mut slot = SessionSlot::new(entry, generation);
                slot.entry.message_ids.clear();
                slot.entry.size_bytes = 0;
                self.sessions.insert(session_id.clone(), slot);
            }
        }

        self.schedule_session_write(&session_id);
        self.changed.insert(session_id.clone());
        self.enforce_budgets(Some(&session_id));
        Ok(())
    }

    /// Guard shared by `put_message` and `apply_event`
    fn check_update(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        sequence_number: u64,
        revision: u64,
    ) -> Result<Option<MessageEntry>, ApplyOutcome> {
        if revision == 0 {
            return Err(ApplyOutcome::ProtocolViolation(format!(
                "message '{}' carries revision 0",
                message_id
            )));
        }

        let Some(slot) = self.sessions.get(session_id) else {
            return Ok(None);
        };

        if let Some(existing) = slot.messages.get(message_id) {
            if revision <= existing.revision {
                return Err(ApplyOutcome::Stale {
                    current_revision: existing.revision,
                });
            }
            if existing.sequence_number != sequence_number {
                return Err(ApplyOutcome::ProtocolViolation(format!(
                    "message '{}' moved from sequence {} to {}",
                    message_id, existing.sequence_number, sequence_number
                )));
            }
            return Ok(Some(existing.clone()));
        }

        if let Some(floor) = slot.entry.truncated_below {
            if sequence_number < floor {
                return Err(ApplyOutcome::BelowTruncationFloor { floor });
            }
        }
        if let Some(holder) = slot.order.get(&sequence_number) {
            return Err(ApplyOutcome::ProtocolViolation(format!(
                "sequence {} already belongs to message '{}'",
                sequence_number, holder
            )));
        }
        Ok(None)
    }

    fn ensure_slot(&mut self, session_id: &SessionId) -> CacheResult<()> {
        let now = self.now();
        let live = self
            .sessions
            .get(session_id)
            .map(|slot| !slot.entry.is_expired(now));
        match live {
            Some(true) => Ok(()),
            _ => self.ensure_stub(session_id).map(|_| ()),
        }
    }

    fn store_message(&mut self, message: MessageEntry, created: bool) -> ApplyOutcome {
        let session_id = message.session_id.clone();
        let message_id = message.message_id.clone();
        let now = self.now();

        let Some(slot) = self.sessions.get_mut(&session_id) else {
            return ApplyOutcome::ProtocolViolation(format!("session '{}' vanished", session_id));
        };

        let previous_size = slot
            .messages
            .get(&message_id)
            .map(|m| m.size_bytes)
            .unwrap_or(0);
        let mut message = message;
        message.size_bytes = previous_size;

        if created {
            slot.order.insert(message.sequence_number, message_id.clone());
        }
        slot.messages.insert(message_id.clone(), message);
        if created {
            slot.sync_message_ids();
        }
        // a session receiving writes is in use, keep it off the LRU end
        slot.entry.last_accessed_at = slot.entry.last_accessed_at.max(now);

        self.schedule_message_write(&session_id, &message_id);
        self.schedule_session_write(&session_id);
        self.changed.insert(session_id.clone());
        self.enforce_budgets(Some(&session_id));

        if created {
            ApplyOutcome::Created
        } else {
            ApplyOutcome::Updated
        }
    }

    /// Idempotent upsert of a whole message, guarded by revision
    pub fn put_message(&mut self, message: MessageEntry) -> CacheResult<ApplyOutcome> {
        self.ensure_slot(&message.session_id)?;
        match self.check_update(
            &message.session_id,
            &message.message_id,
            message.sequence_number,
            message.revision,
        ) {
            Ok(existing) => Ok(self.store_message(message, existing.is_none())),
            Err(outcome) => Ok(outcome),
        }
    }

    /// Merge one stream event into its message, guarded by revision.
    /// Creates a stub on miss.
    pub fn apply_event(
        &mut self,
        session_id: &SessionId,
        event: &MessageEvent,
    ) -> CacheResult<ApplyOutcome> {
        self.ensure_slot(session_id)?;
        Ok(self.merge_event(session_id, event))
    }

    /// Create a stub on miss and return the slot's generation.
    ///
    /// Writers that keep their own view of the session (reconcilers) attach
    /// first and pass the generation back with every write.
    pub fn attach(&mut self, session_id: &SessionId) -> CacheResult<u64> {
        self.ensure_slot(session_id)?;
        self.generation(session_id)
            .ok_or_else(|| CacheError::SessionNotFound(session_id.clone()))
    }

    /// `apply_event` for an attached writer. Nothing is created or changed
    /// once the slot has left `generation`.
    pub fn apply_attached_event(
        &mut self,
        session_id: &SessionId,
        generation: u64,
        event: &MessageEvent,
    ) -> ApplyOutcome {
        if let Err(outcome) = self.check_generation(session_id, generation) {
            return outcome;
        }
        self.merge_event(session_id, event)
    }

    /// `complete_backfill` for an attached writer; refuses to promote a slot
    /// that lost history since `generation`.
    pub fn complete_attached_backfill(
        &mut self,
        session_id: &SessionId,
        generation: u64,
        resume_token: Option<String>,
    ) -> bool {
        if let Err(outcome) = self.check_generation(session_id, generation) {
            tracing::debug!(
                "[CacheStore] Not promoting session '{}' from generation {}: {:?}",
                session_id,
                generation,
                outcome
            );
            return false;
        }
        self.complete_backfill(session_id, resume_token)
    }

    fn check_generation(&self, session_id: &SessionId, generation: u64) -> Result<(), ApplyOutcome> {
        match self.generation(session_id) {
            Some(current) if current == generation => Ok(()),
            current => Err(ApplyOutcome::Invalidated { generation: current }),
        }
    }

    fn merge_event(&mut self, session_id: &SessionId, event: &MessageEvent) -> ApplyOutcome {
        match self.check_update(session_id, &event.message_id, event.sequence_number, event.revision) {
            Ok(existing) => {
                let created = existing.is_none();
                let mut message = existing.unwrap_or_else(|| event.new_entry(session_id));
                event.apply_to(&mut message);
                self.store_message(message, created)
            }
            Err(outcome) => outcome,
        }
    }

    /// Promote after a successful backfill; also refreshes the TTL
    pub fn complete_backfill(&mut self, session_id: &SessionId, resume_token: Option<String>) -> bool {
        let now = self.now();
        let ttl = self.budgets.ttl;
        let Some(slot) = self.sessions.get_mut(session_id) else {
            return false;
        };

        slot.entry.is_fully_cached = true;
        slot.entry.expires_at = now + ttl;
        slot.entry.last_accessed_at = now;
        if resume_token.is_some() {
            slot.entry.resume_token = resume_token;
        }
        tracing::info!(
            "[CacheStore] Session '{}' fully cached with {} messages",
            session_id,
            slot.messages.len()
        );

        self.schedule_session_write(session_id);
        self.changed.insert(session_id.clone());
        self.enforce_budgets(Some(session_id));
        true
    }

    /// Record the latest stream-level resume token; ignored once the slot
    /// has left `generation`
    pub fn set_resume_token(&mut self, session_id: &SessionId, generation: u64, token: String) {
        if self.check_generation(session_id, generation).is_err() {
            return;
        }
        let Some(slot) = self.sessions.get_mut(session_id) else {
            return;
        };
        if slot.entry.resume_token.as_deref() == Some(token.as_str()) {
            return;
        }
        slot.entry.resume_token = Some(token);
        self.schedule_session_write(session_id);
    }

    pub fn set_title(&mut self, session_id: &SessionId, title: Option<String>) -> bool {
        let Some(slot) = self.sessions.get_mut(session_id) else {
            return false;
        };
        slot.entry.title = title;
        self.schedule_session_write(session_id);
        self.changed.insert(session_id.clone());
        true
    }

    /// Reconciler status for snapshots; ignored for sessions no longer resident
    pub fn set_stream_state(&mut self, session_id: &SessionId, state: ReconcilerState) {
        if !self.sessions.contains_key(session_id) {
            return;
        }
        let previous = self.stream_states.insert(session_id.clone(), state);
        if previous != Some(state) {
            self.changed.insert(session_id.clone());
        }
    }

    /// Delete a session and all of its messages
    pub fn remove_session(&mut self, session_id: &SessionId, reason: EvictionReason) -> bool {
        let Some(slot) = self.sessions.remove(session_id) else {
            return false;
        };

        self.total_bytes = self.total_bytes.saturating_sub(slot.entry.size_bytes);
        for message_id in slot.messages.keys() {
            self.outbox.push(PersistOp::Delete {
                key: message_key(session_id, message_id),
            });
        }
        self.outbox.push(PersistOp::Delete {
            key: session_key(session_id),
        });
        self.stream_states.remove(session_id);
        self.changed.insert(session_id.clone());

        tracing::debug!(
            "[CacheStore] Removed session '{}' ({} messages, reason: {})",
            session_id,
            slot.messages.len(),
            reason
        );
        true
    }

    /// Drop a session's messages but keep it discoverable as a stub.
    /// The slot moves to a new generation.
    pub fn demote(&mut self, session_id: &SessionId, reason: EvictionReason) -> bool {
        if !self.sessions.contains_key(session_id) {
            return false;
        }
        let generation = self.issue_generation();
        let Some(slot) = self.sessions.get_mut(session_id) else {
            return false;
        };

        slot.generation = generation;
        let dropped: Vec<MessageId> = slot.messages.keys().cloned().collect();
        slot.messages.clear();
        slot.order.clear();
        slot.message_bytes = 0;
        slot.entry.message_ids.clear();
        slot.entry.is_fully_cached = false;
        slot.entry.truncated_below = None;
        slot.entry.resume_token = None;

        for message_id in &dropped {
            self.outbox.push(PersistOp::Delete {
                key: message_key(session_id, message_id),
            });
        }
        self.schedule_session_write(session_id);
        self.changed.insert(session_id.clone());

        tracing::debug!(
            "[CacheStore] Demoted session '{}' to stub ({} messages dropped, reason: {})",
            session_id,
            dropped.len(),
            reason
        );
        true
    }

    fn trim_messages(
        &mut self,
        session_id: &SessionId,
        message_ids: &[MessageId],
        reason: EvictionReason,
    ) -> usize {
        let Some(slot) = self.sessions.get_mut(session_id) else {
            return 0;
        };

        let mut removed = 0;
        for message_id in message_ids {
            if let Some(message) = slot.messages.remove(message_id) {
                slot.order.remove(&message.sequence_number);
                slot.message_bytes = slot.message_bytes.saturating_sub(message.size_bytes);
                self.outbox.push(PersistOp::Delete {
                    key: message_key(session_id, message_id),
                });
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(
                "[CacheStore] Trimmed {} messages from session '{}' (reason: {})",
                removed,
                session_id,
                reason
            );
            let floor = slot.order.keys().next().copied();
            slot.entry.truncated_below = floor.max(slot.entry.truncated_below);
            slot.sync_message_ids();
            self.schedule_session_write(session_id);
            self.changed.insert(session_id.clone());
        }
        removed
    }

    /// Remove every expired session; run by the periodic sweep and first in enforcement
    pub fn sweep_expired(&mut self) -> Vec<SessionId> {
        let now = self.now();
        let usages = self.usages(None);
        let expired = eviction::select_expired(&usages, now);
        for session_id in &expired {
            self.remove_session(session_id, EvictionReason::Expired);
        }
        if !expired.is_empty() {
            tracing::info!("[CacheStore] Swept {} expired sessions", expired.len());
        }
        expired
    }

    /// Drop everything, in memory and (via the outbox) in persistence
    pub fn clear(&mut self) -> usize {
        let ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        for session_id in &ids {
            self.remove_session(session_id, EvictionReason::Explicit);
        }
        self.stream_states.clear();
        ids.len()
    }

    pub fn set_budgets(&mut self, overrides: &BudgetOverrides) -> EvictionReport {
        self.budgets.apply(overrides);
        tracing::info!("[CacheStore] Budgets updated: {:?}", self.budgets);
        self.enforce_budgets(None)
    }

    fn usages(&self, exclude: Option<&SessionId>) -> Vec<SessionUsage> {
        self.sessions
            .values()
            .filter(|slot| Some(&slot.entry.session_id) != exclude)
            .map(SessionSlot::usage)
            .collect()
    }

    /// Run the eviction algorithm. `hot` names the session whose write
    /// triggered enforcement; it keeps its slot in the count and byte steps.
    pub fn enforce_budgets(&mut self, hot: Option<&SessionId>) -> EvictionReport {
        let mut report = EvictionReport::default();
        let hot = hot.filter(|id| self.sessions.contains_key(*id)).cloned();

        // 1. TTL first, exempt from budget checks
        report.expired = self.sweep_expired();
        let hot = hot.filter(|id| self.sessions.contains_key(id));

        // 2. resident session count
        let hot_is_full = hot
            .as_ref()
            .and_then(|id| self.sessions.get(id))
            .map(|slot| slot.entry.is_fully_cached)
            .unwrap_or(false);
        let reserved = usize::from(hot.is_some());
        let count_budgets = Budgets {
            max_sessions: self.budgets.max_sessions.saturating_sub(reserved),
            max_full_sessions: self
                .budgets
                .max_full_sessions
                .saturating_sub(usize::from(hot_is_full)),
            ..self.budgets.clone()
        };

        let usages = self.usages(hot.as_ref());
        for session_id in eviction::select_sessions_to_evict(&usages, &count_budgets) {
            self.remove_session(&session_id, EvictionReason::SessionCount);
            report.evicted.push(session_id);
        }

        // 3. fully cached count: demote rather than delete
        let usages = self.usages(hot.as_ref());
        for session_id in eviction::select_sessions_to_demote(&usages, &count_budgets) {
            self.demote(&session_id, EvictionReason::FullSessionCount);
            report.demoted.push(session_id);
        }

        // 4. per-session transcript truncation, oldest sequence first
        let max_messages = self.budgets.max_messages_per_session;
        let crowded: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|slot| slot.messages.len() > max_messages)
            .map(|slot| slot.entry.session_id.clone())
            .collect();
        for session_id in crowded {
            let victims = match self.sessions.get(&session_id) {
                Some(slot) => eviction::select_messages_to_trim(&slot.message_usages(), &self.budgets),
                None => continue,
            };
            report.trimmed_messages +=
                self.trim_messages(&session_id, &victims, EvictionReason::MessageCount);
        }

        // 5. byte budget
        if self.total_bytes > self.budgets.max_total_bytes {
            let plan = eviction::plan_byte_budget(
                &self.usages(None),
                self.total_bytes,
                &self.budgets,
                hot.as_ref(),
            );
            for session_id in plan.evict {
                self.remove_session(&session_id, EvictionReason::ByteBudget);
                report.evicted.push(session_id);
            }
            for session_id in plan.demote {
                self.demote(&session_id, EvictionReason::ByteBudget);
                report.demoted.push(session_id);
            }

            // the hot session alone may still be too big: shed its oldest history
            let overage = self.total_bytes.saturating_sub(self.budgets.max_total_bytes);
            if let Some(session_id) = hot.as_ref().filter(|_| overage > 0) {
                let victims = match self.sessions.get(session_id) {
                    Some(slot) => eviction::select_messages_to_shed(&slot.message_usages(), overage),
                    None => Vec::new(),
                };
                report.trimmed_messages +=
                    self.trim_messages(session_id, &victims, EvictionReason::ByteBudget);
            }

            report.over_budget_bytes = self.total_bytes.saturating_sub(self.budgets.max_total_bytes);
            if report.over_budget_bytes > 0 {
                tracing::warn!(
                    "[CacheStore] Still {} bytes over budget after eviction",
                    report.over_budget_bytes
                );
            }
        }

        if !report.is_empty() {
            tracing::debug!(
                "[CacheStore] Enforcement: {} expired, {} evicted, {} demoted, {} messages trimmed",
                report.expired.len(),
                report.evicted.len(),
                report.demoted.len(),
                report.trimmed_messages
            );
        }
        report
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Rebuild the cache from persistence.
    ///
    /// Corrupt keys are deleted one by one and treated as misses; a session
    /// that lost a message that way is demoted so it backfills again.
    pub async fn load(
        adapter: &dyn PersistenceAdapter,
        budgets: Budgets,
        clock: Arc<dyn Clock>,
    ) -> CacheResult<(Self, LoadReport)> {
        let mut store = Self::new(budgets, clock);
        let mut report = LoadReport::default();
        let now = store.now();

        for key in adapter.list_keys(SESSION_PREFIX).await? {
            let Some(PersistKey::Session(session_id)) = PersistKey::parse(&key) else {
                continue;
            };
            let Some(bytes) = read_key(adapter, &key).await else {
                continue;
            };

            let entry = match serde_json::from_slice::<SessionEntry>(&bytes) {
                Ok(entry) if entry.session_id == session_id => entry,
                Ok(_) | Err(_) => {
                    tracing::warn!("[CacheStore] Dropping corrupt entry '{}'", key);
                    drop_key(adapter, &key).await;
                    report.corrupt_keys += 1;
                    continue;
                }
            };

            if entry.is_expired(now) {
                report.expired_sessions += 1;
                drop_key(adapter, &key).await;
                continue;
            }

            let generation = store.issue_generation();
            let mut slot = SessionSlot::new(entry, generation);
            slot.meta_bytes = bytes.len() as u64;
            slot.entry.size_bytes = 0;
            store.sessions.insert(session_id, slot);
        }

        let loaded: HashSet<SessionId> = store.sessions.keys().cloned().collect();
        for key in adapter.list_keys(MESSAGE_PREFIX).await? {
            let Some(PersistKey::Message(session_id, message_id)) = PersistKey::parse(&key) else {
                continue;
            };
            if !loaded.contains(&session_id) {
                drop_key(adapter, &key).await;
                report.orphaned_keys += 1;
                continue;
            }
            let Some(bytes) = read_key(adapter, &key).await else {
                continue;
            };

            let message = match serde_json::from_slice::<MessageEntry>(&bytes) {
                Ok(m) if m.session_id == session_id && m.message_id == message_id => m,
                Ok(_) | Err(_) => {
                    tracing::warn!("[CacheStore] Dropping corrupt entry '{}'", key);
                    drop_key(adapter, &key).await;
                    report.corrupt_keys += 1;
                    if let Some(slot) = store.sessions.get_mut(&session_id) {
                        slot.entry.is_fully_cached = false;
                    }
                    continue;
                }
            };

            if let Some(slot) = store.sessions.get_mut(&session_id) {
                if slot.order.contains_key(&message.sequence_number) {
                    drop_key(adapter, &key).await;
                    report.corrupt_keys += 1;
                    continue;
                }
                let mut message = message;
                message.size_bytes = bytes.len() as u64;
                slot.message_bytes += message.size_bytes;
                slot.order.insert(message.sequence_number, message_id.clone());
                slot.messages.insert(message_id, message);
                report.messages += 1;
            }
        }

        let ids: Vec<SessionId> = store.sessions.keys().cloned().collect();
        for session_id in &ids {
            if let Some(slot) = store.sessions.get_mut(session_id) {
                let listed = slot.entry.message_ids.len();
                slot.sync_message_ids();
                if slot.entry.is_fully_cached && listed != slot.messages.len() {
                    tracing::warn!(
                        "[CacheStore] Session '{}' lost messages on disk, demoting to stub",
                        session_id
                    );
                    slot.entry.is_fully_cached = false;
                }
            }
            store.account(session_id);
        }
        report.sessions = store.sessions.len();

        let enforcement = store.enforce_budgets(None);
        tracing::info!(
            "[CacheStore] Loaded {} sessions / {} messages ({} corrupt, {} expired, {} orphaned keys dropped; {} evicted on load)",
            report.sessions,
            report.messages,
            report.corrupt_keys,
            report.expired_sessions,
            report.orphaned_keys,
            enforcement.evicted.len() + enforcement.demoted.len()
        );
        store.changed.clear();
        Ok((store, report))
    }
}

async fn read_key(adapter: &dyn PersistenceAdapter, key: &str) -> Option<Vec<u8>> {
    match adapter.get(key).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("[CacheStore] Failed to read '{}', treating as miss: {}", key, e);
            None
        }
    }
}

async fn drop_key(adapter: &dyn PersistenceAdapter, key: &str) {
    if let Err(e) = adapter.delete(key).await {
        tracing::warn!("[CacheStore] Failed to delete '{}': {}", key, e);
    }
}
