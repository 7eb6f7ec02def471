//! Test fixtures: message builders and a recording listener

use crate::core_model::{ConversationKey, Diff, Message, MessageRecord, RawEvent, Timestamp};
use crate::core_sync::{ConversationListener, SyncError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub fn conversation(a: &str, b: &str) -> ConversationKey {
    match ConversationKey::new(a.into(), b.into()) {
        Some(key) => key,
        None => panic!("conversation needs two distinct users, got {} twice", a),
    }
}

pub fn record(sender: &str, receiver: &str, body: &str, sent_at: u64) -> MessageRecord {
    MessageRecord::new(sender.into(), receiver.into(), body, Timestamp(sent_at))
}

pub fn message(id: &str, sender: &str, receiver: &str, sent_at: u64) -> Message {
    Message::new(id.into(), sender.into(), receiver.into(), format!("body of {}", id), Timestamp(sent_at))
}

/// `ADDED` event whose body is derived from the id
pub fn added(id: &str, sender: &str, receiver: &str, sent_at: u64) -> RawEvent {
    RawEvent::added(id, message(id, sender, receiver, sent_at).to_record())
}

/// Everything a listener was told, in order
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Snapshot(Vec<Message>),
    Diff(Diff),
    SourceError(SyncError),
}

#[derive(Default)]
struct Recorded {
    events: Vec<ListenerEvent>,

    /// Snapshot with every diff applied since
    view: Vec<Message>,
}

/// Listener that records every callback and mirrors the conversation.
///
/// With a fence attached, any callback made while the fence is raised is
/// counted as a violation.
#[derive(Default)]
pub struct RecordingListener {
    recorded: Mutex<Recorded>,
    fence: Option<Arc<AtomicBool>>,
    violations: AtomicUsize,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_fence(fence: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            fence: Some(fence),
            ..Self::default()
        })
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_fence(&self) {
        if let Some(fence) = &self.fence {
            if fence.load(Ordering::SeqCst) {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.lock().events.clone()
    }

    pub fn diffs(&self) -> Vec<Diff> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::Diff(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn source_errors(&self) -> Vec<SyncError> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::SourceError(err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| matches!(e, ListenerEvent::Snapshot(_)))
            .count()
    }

    /// The conversation as reconstructed from the callbacks
    pub fn view(&self) -> Vec<Message> {
        self.lock().view.clone()
    }

    pub fn view_len(&self) -> usize {
        self.lock().view.len()
    }

    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }
}

impl ConversationListener for RecordingListener {
    fn on_snapshot(&self, messages: &[Message]) {
        self.check_fence();
        let mut recorded = self.lock();
        recorded.view = messages.to_vec();
        recorded.events.push(ListenerEvent::Snapshot(messages.to_vec()));
    }

    fn on_diff(&self, diff: &Diff) {
        self.check_fence();
        let mut recorded = self.lock();
        diff.apply_to(&mut recorded.view);
        recorded.events.push(ListenerEvent::Diff(diff.clone()));
    }

    fn on_source_error(&self, error: &SyncError) {
        self.check_fence();
        self.lock().events.push(ListenerEvent::SourceError(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_listener_mirrors_diffs() {
        let listener = RecordingListener::new();
        let m1 = message("m1", "alice", "bob", 10);
        let m2 = message("m2", "bob", "alice", 5);

        listener.on_snapshot(&[m1.clone()]);
        listener.on_diff(&Diff::insert(0, m2.clone()));

        assert_eq!(listener.view(), vec![m2, m1]);
        assert_eq!(listener.snapshot_count(), 1);
        assert_eq!(listener.diffs().len(), 1);
    }

    #[test]
    fn test_fence_counts_violations() {
        let fence = Arc::new(AtomicBool::new(false));
        let listener = RecordingListener::with_fence(fence.clone());

        listener.on_snapshot(&[]);
        assert_eq!(listener.violations(), 0);

        fence.store(true, Ordering::SeqCst);
        listener.on_diff(&Diff::insert(0, message("m1", "alice", "bob", 1)));
        assert_eq!(listener.violations(), 1);
    }

    #[test]
    fn test_added_builds_complete_record() {
        let event = added("m1", "alice", "bob", 3);
        let msg = event.record.to_message(&"m1".into()).unwrap();
        assert_eq!(msg, message("m1", "alice", "bob", 3));
    }
}
