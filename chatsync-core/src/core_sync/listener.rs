//! Listener seam for UI-side consumers

use super::errors::SyncError;
use crate::core_model::{Diff, Message};
use std::fmt;

/// Receives a conversation's state and its changes.
///
/// Callbacks run on the handle's worker, one at a time and in apply order, so
/// they should return quickly. No callback is made once `close` has returned.
pub trait ConversationListener: Send + Sync + 'static {
    /// Full ordered sequence. Always the first call a listener sees.
    fn on_snapshot(&self, messages: &[Message]);

    /// One non-empty change, in the order it was applied
    fn on_diff(&self, diff: &Diff);

    /// A source reported an outage. State is kept and the handle stays open;
    /// rejected events are only logged.
    fn on_source_error(&self, _error: &SyncError) {}
}

/// Identifies one listener registration on a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}
