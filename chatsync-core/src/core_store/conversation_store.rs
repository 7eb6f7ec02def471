/*
    conversation_store.rs - Ordered, deduplicated message set for one conversation

    Invariants after every apply:
    - no two messages share an id
    - messages are strictly sorted by (sent_at, id)
    - a rejected event leaves the sequence untouched

    The store has a single owner (the per-handle worker), so it takes
    `&mut self` and does no locking of its own.
*/

use super::errors::{StoreError, StoreResult};
use crate::core_model::{ChangeKind, ConversationKey, Diff, Message, MessageId, RawEvent, Timestamp};
use std::collections::HashMap;

/// Ordered conversation state plus the diff computation over it
#[derive(Debug, Clone)]
pub struct ConversationStore {
    key: ConversationKey,

    /// Sorted by (sent_at, id)
    messages: Vec<Message>,

    /// id -> sent_at, so a known id can be located by binary search
    index: HashMap<MessageId, Timestamp>,

    /// Next local arrival counter
    next_seq: u64,
}

impl ConversationStore {
    /// Create an empty store for a conversation
    pub fn new(key: ConversationKey) -> Self {
        Self {
            key,
            messages: Vec::new(),
            index: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// The ordered sequence
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.position(id).map(|pos| &self.messages[pos])
    }

    /// Current index of a message in the ordered sequence
    pub fn position(&self, id: &MessageId) -> Option<usize> {
        let sent_at = *self.index.get(id)?;
        self.messages
            .binary_search_by(|m| m.order_key().cmp(&(sent_at, id)))
            .ok()
    }

    /// Apply one change event and report what changed.
    ///
    /// Redelivery of an already-known `ADDED` record is a no-op with an empty
    /// diff. Malformed events are rejected without touching state.
    pub fn apply(&mut self, event: &RawEvent) -> StoreResult<Diff> {
        let id = event
            .record_id
            .as_ref()
            .ok_or_else(|| StoreError::MalformedEvent(format!("{} event without record id", event.kind)))?;

        match event.kind {
            ChangeKind::Removed => Ok(self.remove(id)),
            ChangeKind::Added => {
                let message = self.validate(event, id)?;
                if self.index.contains_key(id) {
                    return Ok(Diff::empty());
                }
                Ok(self.insert(message))
            }
            ChangeKind::Modified => {
                let message = self.validate(event, id)?;
                match self.position(id) {
                    Some(pos) => Ok(self.replace(pos, message)),
                    None => Ok(self.insert(message)),
                }
            }
        }
    }

    /// Apply a batch in order, collecting the non-empty diffs.
    ///
    /// Rejected events are skipped and returned alongside.
    pub fn apply_batch(&mut self, events: &[RawEvent]) -> (Vec<Diff>, Vec<StoreError>) {
        let mut diffs = Vec::new();
        let mut errors = Vec::new();

        for event in events {
            match self.apply(event) {
                Ok(diff) if !diff.is_empty() => diffs.push(diff),
                Ok(_) => {}
                Err(e) => errors.push(e),
            }
        }

        (diffs, errors)
    }

    fn validate(&self, event: &RawEvent, id: &MessageId) -> StoreResult<Message> {
        let message = event.record.to_message(id)?;

        if !self.key.matches(&message.sender_id, &message.receiver_id) {
            return Err(StoreError::ForeignMessage {
                id: id.to_string(),
                sender: message.sender_id.to_string(),
                receiver: message.receiver_id.to_string(),
                conversation: self.key.to_string(),
            });
        }

        Ok(message)
    }

    fn insertion_point(&self, message: &Message) -> usize {
        match self.messages.binary_search_by(|m| m.cmp_order(message)) {
            Ok(pos) | Err(pos) => pos,
        }
    }

    fn insert(&mut self, mut message: Message) -> Diff {
        message.insertion_seq = self.next_seq;
        self.next_seq += 1;

        let pos = self.insertion_point(&message);
        self.index.insert(message.id.clone(), message.sent_at);
        self.messages.insert(pos, message.clone());

        Diff::insert(pos, message)
    }

    fn replace(&mut self, pos: usize, mut message: Message) -> Diff {
        let existing = &self.messages[pos];
        if existing == &message {
            return Diff::empty();
        }
        message.insertion_seq = existing.insertion_seq;

        if existing.sent_at == message.sent_at {
            self.messages[pos] = message.clone();
            return Diff::update(pos, message);
        }

        self.messages.remove(pos);
        let new_pos = self.insertion_point(&message);
        self.index.insert(message.id.clone(), message.sent_at);
        self.messages.insert(new_pos, message.clone());

        if new_pos == pos {
            Diff::update(pos, message)
        } else {
            Diff::relocate(pos, new_pos, message)
        }
    }

    fn remove(&mut self, id: &MessageId) -> Diff {
        match self.position(id) {
            Some(pos) => {
                self.messages.remove(pos);
                self.index.remove(id);
                Diff::remove(pos)
            }
            None => Diff::empty(),
        }
    }
}
