//! Conversation store
//!
//! Holds the deduplicated, totally ordered message sequence of one
//! conversation and reports what each applied event changed.

pub mod conversation_store;
pub mod errors;

pub use conversation_store::ConversationStore;
pub use errors::{StoreError, StoreResult};
