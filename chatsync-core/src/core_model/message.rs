/*
    message.rs - Conversation message model

    Two shapes of the same thing:
    - MessageRecord: the keyed document as the store delivers it. Every field
      is optional because the transport gives no schema guarantee.
    - Message: a validated, immutable message as held by a ConversationStore.

    Field names on the record follow the store's document layout
    (senderId / receiverId / message / timestamp).
*/

use super::types::{MessageId, Timestamp, UserId};
use crate::core_store::errors::StoreError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Raw message document as stored by the backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,

    /// Message text
    #[serde(default, rename = "message", skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    /// Authoritative store timestamp
    #[serde(default, rename = "timestamp", skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<Timestamp>,
}

impl MessageRecord {
    /// Build a complete record
    pub fn new(
        sender_id: UserId,
        receiver_id: UserId,
        body: impl Into<String>,
        sent_at: Timestamp,
    ) -> Self {
        Self {
            sender_id: Some(sender_id),
            receiver_id: Some(receiver_id),
            body: Some(body.into()),
            sent_at: Some(sent_at),
        }
    }

    /// Validate the record and turn it into a message with the given id.
    ///
    /// `insertion_seq` is left at zero; the store stamps it on insert.
    pub fn to_message(&self, id: &MessageId) -> Result<Message, StoreError> {
        let missing = |field: &str| StoreError::MalformedEvent(format!(
            "record {} is missing required field '{}'",
            id, field
        ));

        let sender_id = self.sender_id.clone().ok_or_else(|| missing("senderId"))?;
        let receiver_id = self.receiver_id.clone().ok_or_else(|| missing("receiverId"))?;
        let body = self.body.clone().ok_or_else(|| missing("message"))?;
        let sent_at = self.sent_at.ok_or_else(|| missing("timestamp"))?;

        Ok(Message {
            id: id.clone(),
            sender_id,
            receiver_id,
            body,
            sent_at,
            insertion_seq: 0,
        })
    }
}

/// Which side of the conversation a message is on, from the local user's view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

/// A validated message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned id, unique per conversation pair
    pub id: MessageId,

    pub sender_id: UserId,

    pub receiver_id: UserId,

    pub body: String,

    /// Authoritative timestamp; monotonic per sender only
    pub sent_at: Timestamp,

    /// Local arrival counter. Never used for ordering and not part of equality.
    pub insertion_seq: u64,
}

impl Message {
    pub fn new(
        id: MessageId,
        sender_id: UserId,
        receiver_id: UserId,
        body: impl Into<String>,
        sent_at: Timestamp,
    ) -> Self {
        Self {
            id,
            sender_id,
            receiver_id,
            body: body.into(),
            sent_at,
            insertion_seq: 0,
        }
    }

    /// Total conversation order: `sent_at` first, then `id`
    pub fn order_key(&self) -> (Timestamp, &MessageId) {
        (self.sent_at, &self.id)
    }

    pub fn cmp_order(&self, other: &Message) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }

    pub fn direction(&self, local_user: &UserId) -> Direction {
        if &self.sender_id == local_user {
            Direction::Sent
        } else {
            Direction::Received
        }
    }

    /// Record form of this message, as the store would deliver it
    pub fn to_record(&self) -> MessageRecord {
        MessageRecord::new(
            self.sender_id.clone(),
            self.receiver_id.clone(),
            self.body.clone(),
            self.sent_at,
        )
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.sender_id == other.sender_id
            && self.receiver_id == other.receiver_id
            && self.body == other.body
            && self.sent_at == other.sent_at
    }
}

impl Eq for Message {}
