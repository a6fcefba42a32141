//! Reorder buffer for order-sensitive events that arrived ahead of a gap
//!
//! Events wait here until the missing revisions arrive. A message whose gap
//! does not close within the window loses all its held events; the caller
//! then resyncs that message from the source.

use crate::core::{MessageEvent, MessageId};
use std::collections::{BTreeMap, HashMap};
use tokio::time::{Duration, Instant};

struct Held {
    event: MessageEvent,
    deadline: Instant,
}

pub struct ReorderBuffer {
    window: Duration,
    held: HashMap<MessageId, BTreeMap<u64, Held>>,
}

impl ReorderBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            held: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.held.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Park an event; a second copy of the same revision is ignored
    pub fn hold(&mut self, event: MessageEvent, now: Instant) {
        let deadline = now + self.window;
        self.held
            .entry(event.message_id.clone())
            .or_default()
            .entry(event.revision)
            .or_insert(Held { event, deadline });
    }

    /// Next event for `message_id` if it directly follows `current_revision`.
    /// Held events at or below the current revision are dropped on the way.
    pub fn take_next(&mut self, message_id: &MessageId, current_revision: u64) -> Option<MessageEvent> {
        let queue = self.held.get_mut(message_id)?;
        while let Some(entry) = queue.first_entry() {
            if *entry.key() <= current_revision {
                entry.remove();
            } else {
                break;
            }
        }

        let next = match queue.first_entry() {
            Some(entry) if *entry.key() == current_revision + 1 => Some(entry.remove().event),
            _ => None,
        };
        if queue.is_empty() {
            self.held.remove(message_id);
        }
        next
    }

    /// Discard held events of every message whose gap outlived the window
    pub fn expire(&mut self, now: Instant) -> Vec<(MessageId, usize)> {
        let mut expired: Vec<(MessageId, usize)> = self
            .held
            .iter()
            .filter(|(_, queue)| queue.values().any(|held| held.deadline <= now))
            .map(|(id, queue)| (id.clone(), queue.len()))
            .collect();
        expired.sort();
        for (message_id, _) in &expired {
            self.held.remove(message_id);
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.held
            .values()
            .flat_map(|queue| queue.values().map(|held| held.deadline))
            .min()
    }

    pub fn clear(&mut self) {
        self.held.clear();
    }
}
