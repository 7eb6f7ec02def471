/*
    errors.rs - Error types for the conversation store

    Every store error is local to one event: the event is discarded and the
    ordered state is left exactly as it was.
*/

use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while applying a change event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Event is missing a required field or is otherwise unusable
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Message participants do not match this conversation
    #[error("Message {id} ({sender} -> {receiver}) does not belong to conversation {conversation}")]
    ForeignMessage {
        id: String,
        sender: String,
        receiver: String,
        conversation: String,
    },
}

impl StoreError {
    /// Whether the event was rejected because of its shape or content
    pub fn is_malformed(&self) -> bool {
        matches!(self, StoreError::MalformedEvent(_) | StoreError::ForeignMessage { .. })
    }
}
