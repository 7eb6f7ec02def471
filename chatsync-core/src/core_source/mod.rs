//! Change sources and message sinks
//!
//! The engine talks to the document store through two seams:
//!
//! - [`ChangeSource`] - push subscription over a directional query
//!   (`sender -> receiver`). Deliveries may replay records the consumer has
//!   already seen, typically after a reconnect.
//! - [`MessageSink`] - the store's write path. The written message only shows
//!   up locally once it comes back through a subscription.
//!
//! [`StreamMerger`] fans several subscriptions into one channel, and
//! [`InMemoryMessageStore`] is an in-process implementation of both seams.

pub mod memory;
pub mod merger;

pub use memory::InMemoryMessageStore;
pub use merger::{MergedEvent, StreamMerger};

use crate::core_model::{MessageId, SourceFilter, SourceNotification, Timestamp, UserId};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Result type for collaborator operations
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors reported by a change source or message sink
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Backend cannot be reached
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// Backend refused the write
    #[error("Write rejected: {0}")]
    Rejected(String),

    /// Unsubscribe for an id the source does not know
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),
}

/// Identifier of one live subscription on a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A live subscription: its id plus the stream of notifications
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub filter: SourceFilter,
    pub notifications: mpsc::Receiver<SourceNotification>,
}

/// Push-based subscription over a filtered record query
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Start delivering changes for records matching `filter`.
    ///
    /// The returned receiver yields notifications in the order the source
    /// produced them. Reconnection is the source's business; it reports a
    /// persistent outage with [`SourceNotification::Unavailable`].
    async fn subscribe(&self, filter: SourceFilter) -> SourceResult<Subscription>;

    /// Stop a subscription. Its receiver sees end-of-stream.
    async fn unsubscribe(&self, id: SubscriptionId) -> SourceResult<()>;
}

/// Write path of the authoritative store
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Persist a new message and return the id the store assigned to it.
    ///
    /// The store decides the authoritative `sent_at`; `client_submit_time`
    /// is only a hint.
    async fn write(
        &self,
        sender_id: &UserId,
        receiver_id: &UserId,
        body: &str,
        client_submit_time: Timestamp,
    ) -> SourceResult<MessageId>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_display() {
        let err = SourceError::UnknownSubscription(SubscriptionId(7));
        assert_eq!(err.to_string(), "Unknown subscription: sub-7");

        let err = SourceError::Rejected("quota".to_string());
        assert_eq!(err.to_string(), "Write rejected: quota");
    }
}
