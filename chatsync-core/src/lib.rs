//! Real-time synchronization of two-party conversations.
//!
//! Messages between two users live in a hosted document store and are
//! watched through two directional subscriptions (`a -> b` and `b -> a`).
//! This crate merges both streams into one ordered, duplicate-free
//! conversation per pair and reports every change as a minimal index-based
//! [`Diff`](core_model::Diff).
//!
//! - [`core_model`] - messages, raw change events, diffs
//! - [`core_store`] - the ordered conversation state and its apply rules
//! - [`core_source`] - collaborator traits, stream merging, in-memory store
//! - [`core_sync`] - the engine, handles and listeners

pub mod config;
pub mod core_model;
pub mod core_source;
pub mod core_store;
pub mod core_sync;
pub mod logging;
pub mod metrics;
pub mod test_utils;

pub use config::Config;
pub use core_model::{ConversationKey, Diff, DiffOp, Direction, Message, MessageId, Timestamp, UserId};
pub use core_source::{ChangeSource, InMemoryMessageStore, MessageSink};
pub use core_store::ConversationStore;
pub use core_sync::{ConversationHandle, ConversationListener, ListenerId, SyncEngine, SyncError};
pub use logging::{init_logging, LogLevel};
