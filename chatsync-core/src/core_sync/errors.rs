//! Engine errors

use crate::core_model::{ConversationKey, SourceFilter, UserId};
use crate::core_source::SourceError;
use crate::core_store::StoreError;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// An event was rejected by the conversation store
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The sink refused or could not persist a message. Not retried.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// A change source reported a persistent outage. The handle stays open.
    #[error("Source {source_index} unavailable: {reason}")]
    SourceUnavailable { source_index: usize, reason: String },

    /// Opening a subscription failed
    #[error("Subscribe to {filter} failed: {reason}")]
    Subscribe { filter: SourceFilter, reason: String },

    /// Operation on a handle that has been closed
    #[error("Conversation handle closed: {0}")]
    HandleClosed(String),

    /// The local user is not part of the requested conversation
    #[error("{user} is not a participant of {conversation}")]
    NotAParticipant { user: UserId, conversation: ConversationKey },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub(crate) fn send_failed(err: SourceError) -> Self {
        SyncError::SendFailed(err.to_string())
    }

    pub(crate) fn subscribe(filter: &SourceFilter, err: SourceError) -> Self {
        SyncError::Subscribe {
            filter: filter.clone(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = SyncError::SourceUnavailable {
            source_index: 1,
            reason: "deadline exceeded".to_string(),
        };
        assert_eq!(err.to_string(), "Source 1 unavailable: deadline exceeded");

        let key = ConversationKey::new("alice".into(), "bob".into()).unwrap();
        let err = SyncError::NotAParticipant {
            user: "carol".into(),
            conversation: key,
        };
        assert_eq!(err.to_string(), "carol is not a participant of alice<->bob");
    }

    #[test]
    fn test_from_source_errors() {
        let err = SyncError::send_failed(SourceError::Rejected("quota".to_string()));
        assert_eq!(err, SyncError::SendFailed("Write rejected: quota".to_string()));

        let filter = SourceFilter::new("alice".into(), "bob".into());
        let err = SyncError::subscribe(&filter, SourceError::Unavailable("down".to_string()));
        assert_eq!(err.to_string(), "Subscribe to alice->bob failed: Source unavailable: down");
    }

    #[test]
    fn test_store_error_is_transparent() {
        let err: SyncError = StoreError::MalformedEvent("no id".to_string()).into();
        assert_eq!(err.to_string(), StoreError::MalformedEvent("no id".to_string()).to_string());
    }
}
