//! Change events as delivered by a change source

use super::message::MessageRecord;
use super::types::{MessageId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of document change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Added => "ADDED",
            ChangeKind::Modified => "MODIFIED",
            ChangeKind::Removed => "REMOVED",
        };
        write!(f, "{}", s)
    }
}

/// One document change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub kind: ChangeKind,

    /// Document key. Required for every kind.
    #[serde(default)]
    pub record_id: Option<MessageId>,

    /// Document body. May be empty for `Removed`.
    #[serde(default)]
    pub record: MessageRecord,
}

impl RawEvent {
    pub fn added(id: impl Into<MessageId>, record: MessageRecord) -> Self {
        Self {
            kind: ChangeKind::Added,
            record_id: Some(id.into()),
            record,
        }
    }

    pub fn modified(id: impl Into<MessageId>, record: MessageRecord) -> Self {
        Self {
            kind: ChangeKind::Modified,
            record_id: Some(id.into()),
            record,
        }
    }

    pub fn removed(id: impl Into<MessageId>) -> Self {
        Self {
            kind: ChangeKind::Removed,
            record_id: Some(id.into()),
            record: MessageRecord::default(),
        }
    }
}

/// Directional query over the message collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceFilter {
    pub sender_id: UserId,
    pub receiver_id: UserId,
}

impl SourceFilter {
    pub fn new(sender_id: UserId, receiver_id: UserId) -> Self {
        Self {
            sender_id,
            receiver_id,
        }
    }

    /// Whether a record satisfies this filter
    pub fn accepts(&self, record: &MessageRecord) -> bool {
        record.sender_id.as_ref() == Some(&self.sender_id)
            && record.receiver_id.as_ref() == Some(&self.receiver_id)
    }
}

impl fmt::Display for SourceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.sender_id, self.receiver_id)
    }
}

/// What a subscription pushes to its consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceNotification {
    /// One snapshot delivery; may replay already-seen records after a reconnect
    Batch(Vec<RawEvent>),

    /// The source reports persistent failure. It may later recover and resume
    /// with `Batch` deliveries.
    Unavailable { reason: String },
}
