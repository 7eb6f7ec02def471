//! Conversation data model
//!
//! Identifiers, messages, change events and diffs shared by the store, the
//! merger and the engine.

pub mod diff;
pub mod event;
pub mod message;
pub mod types;

pub use diff::{Diff, DiffOp};
pub use event::{ChangeKind, RawEvent, SourceFilter, SourceNotification};
pub use message::{Direction, Message, MessageRecord};
pub use types::{ConversationKey, MessageId, Timestamp, UserId};
