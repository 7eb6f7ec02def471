//! In-memory message store
//!
//! Behaves like the hosted document store the engine is written against:
//!
//! - `subscribe` first delivers every existing matching document as `ADDED`,
//!   then incremental changes as they happen
//! - `write` assigns the document id and the authoritative timestamp
//! - an outage is reported with `Unavailable`; on reconnect every matching
//!   document is replayed as `ADDED` (duplicates included), followed by the
//!   modifications and removals missed while disconnected
//!
//! Each subscription has its own outbox and forwarding task, so a consumer
//! that stops draining only stalls itself. The state lock is never held
//! across an `.await` on a subscriber.
//!
//! The extra methods (`insert_record`, `modify`, `remove`, `inject`,
//! `disconnect`, `reconnect`, `fail_writes`) exist to drive the engine from
//! tests, benches and the CLI demo.

use super::{ChangeSource, MessageSink, SourceError, SourceResult, Subscription, SubscriptionId};
use crate::config::SyncConfig;
use crate::core_model::{
    ChangeKind, MessageId, MessageRecord, RawEvent, SourceFilter, SourceNotification, Timestamp,
    UserId,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

struct Subscriber {
    filter: SourceFilter,
    /// Only used to notice that the consumer went away
    tx: mpsc::Sender<SourceNotification>,
    outbox: mpsc::UnboundedSender<SourceNotification>,
    forwarder: JoinHandle<()>,
    connected: bool,
    /// Changes that happened while disconnected
    missed: Vec<RawEvent>,
}

impl Subscriber {
    fn new(id: SubscriptionId, filter: SourceFilter, tx: mpsc::Sender<SourceNotification>) -> Self {
        let (outbox, mut queued) = mpsc::unbounded_channel();
        let consumer = tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = queued.recv().await {
                if consumer.send(notification).await.is_err() {
                    trace!(subscription = %id, "Consumer gone, forwarder exiting");
                    break;
                }
            }
        });

        Self {
            filter,
            tx,
            outbox,
            forwarder,
            connected: true,
            missed: Vec::new(),
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[derive(Default)]
struct StoreState {
    documents: BTreeMap<MessageId, MessageRecord>,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    next_subscription: u64,
    /// Last timestamp handed out by `write`
    clock: u64,
    write_failure: Option<String>,
}

impl StoreState {
    fn matching_documents(&self, filter: &SourceFilter) -> Vec<RawEvent> {
        self.documents
            .iter()
            .filter(|(_, record)| filter.accepts(record))
            .map(|(id, record)| RawEvent::added(id.clone(), record.clone()))
            .collect()
    }

    fn targets(&self, filter: &SourceFilter, connected: bool) -> Vec<SubscriptionId> {
        self.subscribers
            .iter()
            .filter(|(_, s)| s.connected == connected && &s.filter == filter)
            .map(|(id, _)| *id)
            .collect()
    }

    fn publish(&mut self, event: RawEvent) {
        let record = event.record.clone();
        self.publish_for(event, &record);
    }

    /// Fan an event out to subscriptions whose filter accepts `matched`
    fn publish_for(&mut self, event: RawEvent, matched: &MessageRecord) {
        let targets: Vec<(SubscriptionId, bool)> = self
            .subscribers
            .iter()
            .filter(|(_, s)| s.filter.accepts(matched))
            .map(|(id, s)| (*id, s.connected))
            .collect();

        for (id, connected) in targets {
            if connected {
                self.deliver(id, SourceNotification::Batch(vec![event.clone()]));
            } else if let Some(sub) = self.subscribers.get_mut(&id) {
                sub.missed.push(event.clone());
            }
        }
    }

    /// Queue for one subscription, dropping it if its consumer has gone away
    fn deliver(&mut self, id: SubscriptionId, notification: SourceNotification) -> bool {
        let queued = match self.subscribers.get(&id) {
            Some(sub) => !sub.tx.is_closed() && sub.outbox.send(notification).is_ok(),
            None => return false,
        };
        if !queued {
            debug!(subscription = %id, "Subscriber dropped its receiver, removing");
            self.subscribers.remove(&id);
        }
        queued
    }
}

/// In-process document store implementing both collaborator seams
pub struct InMemoryMessageStore {
    state: Mutex<StoreState>,
    buffer: usize,
}

impl InMemoryMessageStore {
    /// Create an empty store whose subscriptions buffer `buffer` notifications
    pub fn new(buffer: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            buffer: buffer.max(1),
        }
    }

    pub fn with_config(config: &SyncConfig) -> Self {
        Self::new(config.source_buffer)
    }

    pub async fn document_count(&self) -> usize {
        self.state.lock().await.documents.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    pub async fn get(&self, id: &MessageId) -> Option<MessageRecord> {
        self.state.lock().await.documents.get(id).cloned()
    }

    /// Make every following `write` fail with `reason`, or clear with `None`
    pub async fn fail_writes(&self, reason: Option<String>) {
        self.state.lock().await.write_failure = reason;
    }

    /// Store a document under a caller-chosen id and timestamp
    pub async fn insert_record(&self, id: impl Into<MessageId>, record: MessageRecord) {
        let id = id.into();
        let mut state = self.state.lock().await;
        if let Some(t) = record.sent_at {
            state.clock = state.clock.max(t.as_millis());
        }
        state.documents.insert(id.clone(), record.clone());
        state.publish(RawEvent::added(id, record));
    }

    /// Replace a document's body. Returns false for an unknown id.
    pub async fn modify(&self, id: &MessageId, body: impl Into<String>) -> bool {
        let mut state = self.state.lock().await;
        let record = match state.documents.get_mut(id) {
            Some(record) => {
                record.body = Some(body.into());
                record.clone()
            }
            None => return false,
        };
        state.publish(RawEvent::modified(id.clone(), record));
        true
    }

    /// Replace a whole document. Returns false for an unknown id.
    pub async fn modify_record(&self, id: &MessageId, record: MessageRecord) -> bool {
        let mut state = self.state.lock().await;
        let previous = match state.documents.get_mut(id) {
            Some(existing) => std::mem::replace(existing, record.clone()),
            None => return false,
        };
        state.publish_for(RawEvent::modified(id.clone(), record), &previous);
        true
    }

    /// Delete a document. Returns false for an unknown id.
    pub async fn remove(&self, id: &MessageId) -> bool {
        let mut state = self.state.lock().await;
        let previous = match state.documents.remove(id) {
            Some(record) => record,
            None => return false,
        };
        state.publish_for(RawEvent::removed(id.clone()), &previous);
        true
    }

    /// Deliver a raw batch to every connected subscription with this filter,
    /// without touching the stored documents. Used to simulate redelivery and
    /// malformed input.
    pub async fn inject(&self, filter: &SourceFilter, events: Vec<RawEvent>) -> usize {
        let mut state = self.state.lock().await;
        state
            .targets(filter, true)
            .into_iter()
            .filter(|id| state.deliver(*id, SourceNotification::Batch(events.clone())))
            .count()
    }

    /// Report an outage on every subscription with this filter
    pub async fn disconnect(&self, filter: &SourceFilter, reason: &str) {
        let mut state = self.state.lock().await;
        warn!(filter = %filter, reason, "Simulating source outage");
        for id in state.targets(filter, true) {
            let notification = SourceNotification::Unavailable {
                reason: reason.to_string(),
            };
            if state.deliver(id, notification) {
                if let Some(sub) = state.subscribers.get_mut(&id) {
                    sub.connected = false;
                }
            }
        }
    }

    /// Bring subscriptions with this filter back and replay their documents
    pub async fn reconnect(&self, filter: &SourceFilter) {
        let mut state = self.state.lock().await;
        let targets = state.targets(filter, false);

        info!(filter = %filter, subscriptions = targets.len(), "Reconnecting source");
        for id in targets {
            let mut batch = state.matching_documents(filter);
            if let Some(sub) = state.subscribers.get_mut(&id) {
                sub.connected = true;
                batch.extend(
                    sub.missed
                        .drain(..)
                        .filter(|event| event.kind != ChangeKind::Added),
                );
            }
            state.deliver(id, SourceNotification::Batch(batch));
        }
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::with_config(&SyncConfig::default())
    }
}

#[async_trait]
impl ChangeSource for InMemoryMessageStore {
    async fn subscribe(&self, filter: SourceFilter) -> SourceResult<Subscription> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut state = self.state.lock().await;

        state.next_subscription += 1;
        let id = SubscriptionId(state.next_subscription);
        let initial = state.matching_documents(&filter);

        state.subscribers.insert(id, Subscriber::new(id, filter.clone(), tx));
        debug!(subscription = %id, filter = %filter, initial = initial.len(), "Subscription opened");

        if !initial.is_empty() {
            state.deliver(id, SourceNotification::Batch(initial));
        }

        Ok(Subscription {
            id,
            filter,
            notifications: rx,
        })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> SourceResult<()> {
        let mut state = self.state.lock().await;
        match state.subscribers.remove(&id) {
            Some(_) => {
                debug!(subscription = %id, "Subscription closed");
                Ok(())
            }
            None => Err(SourceError::UnknownSubscription(id)),
        }
    }
}

#[async_trait]
impl MessageSink for InMemoryMessageStore {
    async fn write(
        &self,
        sender_id: &UserId,
        receiver_id: &UserId,
        body: &str,
        client_submit_time: Timestamp,
    ) -> SourceResult<MessageId> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.write_failure {
            return Err(SourceError::Rejected(reason.clone()));
        }

        let sent_at = client_submit_time.as_millis().max(state.clock + 1);
        state.clock = sent_at;

        let id = MessageId::generate();
        let record = MessageRecord::new(
            sender_id.clone(),
            receiver_id.clone(),
            body,
            Timestamp::from_millis(sent_at),
        );
        state.documents.insert(id.clone(), record.clone());
        state.publish(RawEvent::added(id.clone(), record));

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{recv_timeout, try_drain, DEFAULT_TEST_TIMEOUT};

    fn ab() -> SourceFilter {
        SourceFilter::new("alice".into(), "bob".into())
    }

    fn ba() -> SourceFilter {
        SourceFilter::new("bob".into(), "alice".into())
    }

    async fn next_batch(sub: &mut Subscription) -> Vec<RawEvent> {
        match recv_timeout(&mut sub.notifications, DEFAULT_TEST_TIMEOUT).await.unwrap() {
            SourceNotification::Batch(events) => events,
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_assigns_id_and_monotonic_time() {
        let store = InMemoryMessageStore::new(16);
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        let id1 = store.write(&alice, &bob, "one", Timestamp(500)).await.unwrap();
        let id2 = store.write(&alice, &bob, "two", Timestamp(100)).await.unwrap();

        assert_ne!(id1, id2);
        let t1 = store.get(&id1).await.unwrap().sent_at.unwrap();
        let t2 = store.get(&id2).await.unwrap().sent_at.unwrap();
        assert_eq!(t1, Timestamp(500));
        assert!(t2 > t1);
    }

    #[tokio::test]
    async fn test_subscribe_delivers_existing_then_live() {
        let store = InMemoryMessageStore::new(16);
        store
            .insert_record("m1", MessageRecord::new("alice".into(), "bob".into(), "old", Timestamp(1)))
            .await;
        store
            .insert_record("m2", MessageRecord::new("bob".into(), "alice".into(), "other way", Timestamp(2)))
            .await;

        let mut sub = store.subscribe(ab()).await.unwrap();
        let initial = next_batch(&mut sub).await;
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].record_id, Some("m1".into()));

        store
            .write(&"alice".into(), &"bob".into(), "new", Timestamp(3))
            .await
            .unwrap();
        let live = next_batch(&mut sub).await;
        assert_eq!(live[0].kind, ChangeKind::Added);
        assert_eq!(live[0].record.body.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_filters_are_directional() {
        let store = InMemoryMessageStore::new(16);
        let mut forward = store.subscribe(ab()).await.unwrap();
        let mut backward = store.subscribe(ba()).await.unwrap();

        store
            .write(&"bob".into(), &"alice".into(), "hey", Timestamp(1))
            .await
            .unwrap();

        assert_eq!(next_batch(&mut backward).await.len(), 1);
        assert!(try_drain(&mut forward.notifications).is_empty());
    }

    #[tokio::test]
    async fn test_write_failure() {
        let store = InMemoryMessageStore::new(16);
        store.fail_writes(Some("offline".to_string())).await;

        let err = store
            .write(&"alice".into(), &"bob".into(), "x", Timestamp(1))
            .await
            .unwrap_err();
        assert_eq!(err, SourceError::Rejected("offline".to_string()));
        assert_eq!(store.document_count().await, 0);

        store.fail_writes(None).await;
        assert!(store.write(&"alice".into(), &"bob".into(), "x", Timestamp(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_modify_and_remove_are_published() {
        let store = InMemoryMessageStore::new(16);
        let mut sub = store.subscribe(ab()).await.unwrap();
        let id = store
            .write(&"alice".into(), &"bob".into(), "draft", Timestamp(1))
            .await
            .unwrap();
        next_batch(&mut sub).await;

        assert!(store.modify(&id, "final").await);
        let modified = next_batch(&mut sub).await;
        assert_eq!(modified[0].kind, ChangeKind::Modified);
        assert_eq!(modified[0].record.body.as_deref(), Some("final"));

        assert!(store.remove(&id).await);
        let removed = next_batch(&mut sub).await;
        assert_eq!(removed[0], RawEvent::removed(id.clone()));

        assert!(!store.remove(&id).await);
        assert!(!store.modify(&id, "gone").await);
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect_replays() {
        let store = InMemoryMessageStore::new(16);
        let mut sub = store.subscribe(ab()).await.unwrap();
        let kept = store
            .write(&"alice".into(), &"bob".into(), "kept", Timestamp(1))
            .await
            .unwrap();
        let dropped = store
            .write(&"alice".into(), &"bob".into(), "dropped", Timestamp(2))
            .await
            .unwrap();
        next_batch(&mut sub).await;
        next_batch(&mut sub).await;

        store.disconnect(&ab(), "network down").await;
        let outage = recv_timeout(&mut sub.notifications, DEFAULT_TEST_TIMEOUT).await.unwrap();
        assert!(matches!(outage, SourceNotification::Unavailable { .. }));

        store.remove(&dropped).await;
        store
            .write(&"alice".into(), &"bob".into(), "while away", Timestamp(3))
            .await
            .unwrap();
        assert!(try_drain(&mut sub.notifications).is_empty());

        store.reconnect(&ab()).await;
        let replay = next_batch(&mut sub).await;
        let added: Vec<_> = replay.iter().filter(|e| e.kind == ChangeKind::Added).collect();
        assert_eq!(added.len(), 2);
        assert!(added.iter().any(|e| e.record_id.as_ref() == Some(&kept)));
        assert!(replay.contains(&RawEvent::removed(dropped)));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let store = InMemoryMessageStore::new(16);
        let mut sub = store.subscribe(ab()).await.unwrap();
        assert_eq!(store.subscriber_count().await, 1);

        store.unsubscribe(sub.id).await.unwrap();
        assert_eq!(store.subscriber_count().await, 0);
        assert!(sub.notifications.recv().await.is_none());

        let err = store.unsubscribe(sub.id).await.unwrap_err();
        assert_eq!(err, SourceError::UnknownSubscription(sub.id));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let store = InMemoryMessageStore::new(16);
        let sub = store.subscribe(ab()).await.unwrap();
        drop(sub);

        store
            .write(&"alice".into(), &"bob".into(), "x", Timestamp(1))
            .await
            .unwrap();
        assert_eq!(store.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_inject_raw_events() {
        let store = InMemoryMessageStore::new(16);
        let mut sub = store.subscribe(ab()).await.unwrap();

        let delivered = store.inject(&ab(), vec![RawEvent::removed("ghost")]).await;
        assert_eq!(delivered, 1);
        assert_eq!(next_batch(&mut sub).await, vec![RawEvent::removed("ghost")]);
        assert_eq!(store.inject(&ba(), vec![]).await, 0);
    }

    #[tokio::test]
    async fn test_stalled_subscriber_does_not_block_other_conversations() {
        let store = InMemoryMessageStore::new(1);
        let _stalled = store.subscribe(ab()).await.unwrap();
        let mut other = store
            .subscribe(SourceFilter::new("carol".into(), "dave".into()))
            .await
            .unwrap();

        for i in 0..3 {
            store.write(&"alice".into(), &"bob".into(), "unread", Timestamp(i)).await.unwrap();
        }

        let (carol, dave): (UserId, UserId) = ("carol".into(), "dave".into());
        let write = store.write(&carol, &dave, "hi", Timestamp(10));
        let id = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, write)
            .await
            .expect("write blocked by a stalled subscriber")
            .unwrap();
        assert_eq!(next_batch(&mut other).await[0].record_id, Some(id));

        let unsubscribe = store.unsubscribe(other.id);
        assert!(tokio::time::timeout(DEFAULT_TEST_TIMEOUT, unsubscribe).await.is_ok());
    }

    #[tokio::test]
    async fn test_slow_consumer_keeps_order_past_buffer() {
        let store = InMemoryMessageStore::new(1);
        let mut sub = store.subscribe(ab()).await.unwrap();

        let mut written = Vec::new();
        for i in 0..10 {
            written.push(store.write(&"alice".into(), &"bob".into(), "x", Timestamp(i)).await.unwrap());
        }

        let mut received = Vec::new();
        for _ in 0..10 {
            received.extend(next_batch(&mut sub).await.into_iter().filter_map(|e| e.record_id));
        }
        assert_eq!(received, written);
    }
}
