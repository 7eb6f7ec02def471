/*
    types.rs - Identifier and time types for the conversation model

    Defines:
    - UserId / MessageId (opaque string identifiers assigned by the store)
    - Timestamp (milliseconds, authoritative store clock)
    - ConversationKey (unordered participant pair)
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unix timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Create a timestamp representing the current time
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(millis)
    }

    /// Create a timestamp from milliseconds since epoch
    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    /// Get milliseconds since epoch
    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a chat participant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        UserId(s)
    }
}

/// Store-assigned message identifier.
///
/// Ordering is plain lexicographic comparison of the underlying string, which
/// is what the conversation order uses to break `sent_at` ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }

    pub fn generate() -> Self {
        use uuid::Uuid;
        MessageId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        MessageId(s)
    }
}

/// Unordered pair of participants identifying one two-party conversation.
///
/// Always stored in canonical (sorted) form, so `(alice, bob)` and
/// `(bob, alice)` compare and hash equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "KeyParts")]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    /// Build a key from two distinct participants.
    ///
    /// Returns `None` when both sides are the same user.
    pub fn new(a: UserId, b: UserId) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { low: a, high: b }),
            std::cmp::Ordering::Greater => Some(Self { low: b, high: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// Both participants in canonical order
    pub fn participants(&self) -> (&UserId, &UserId) {
        (&self.low, &self.high)
    }

    pub fn contains(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }

    /// The participant that is not `user`, if `user` belongs to this conversation
    pub fn peer_of(&self, user: &UserId) -> Option<&UserId> {
        if &self.low == user {
            Some(&self.high)
        } else if &self.high == user {
            Some(&self.low)
        } else {
            None
        }
    }

    /// Whether a message between `sender` and `receiver` belongs here
    pub fn matches(&self, sender: &UserId, receiver: &UserId) -> bool {
        (sender == &self.low && receiver == &self.high)
            || (sender == &self.high && receiver == &self.low)
    }
}

/// Serialized form, re-checked through `ConversationKey::new`
#[derive(Deserialize)]
struct KeyParts {
    low: UserId,
    high: UserId,
}

impl TryFrom<KeyParts> for ConversationKey {
    type Error = String;

    fn try_from(parts: KeyParts) -> Result<Self, Self::Error> {
        ConversationKey::new(parts.low, parts.high)
            .ok_or_else(|| "conversation needs two distinct participants".to_string())
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.low, self.high)
    }
}
