//! Conversation synchronization
//!
//! [`SyncEngine`] opens a [`ConversationHandle`] per conversation. Each handle
//! subscribes to both message directions, merges them, applies every event
//! to its [`ConversationStore`](crate::core_store::ConversationStore) on a
//! single worker and pushes the resulting diffs to its
//! [`ConversationListener`]s.

pub mod engine;
pub mod errors;
pub mod handle;
pub mod listener;

pub use engine::SyncEngine;
pub use errors::{SyncError, SyncResult};
pub use handle::ConversationHandle;
pub use listener::{ConversationListener, ListenerId};
