//! Sync engine: opens, tracks and closes conversation handles for one local user

use super::errors::{SyncError, SyncResult};
use super::handle::ConversationHandle;
use super::listener::{ConversationListener, ListenerId};
use crate::config::SyncConfig;
use crate::core_model::{ConversationKey, Message, MessageId, SourceFilter, Timestamp, UserId};
use crate::core_source::{ChangeSource, MessageSink};
use crate::metrics::{record_counter, record_gauge, HANDLES_OPEN, MESSAGES_SENT, SEND_FAILED};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

type HandleSlot = OnceCell<ConversationHandle>;

fn is_live(slot: &HandleSlot) -> bool {
    slot.get().is_some_and(|handle| !handle.is_closed())
}

fn live_handles(registry: &HashMap<ConversationKey, Arc<HandleSlot>>) -> usize {
    registry.values().filter(|slot| is_live(slot)).count()
}

pub struct SyncEngine {
    local_user: UserId,
    source: Arc<dyn ChangeSource>,
    sink: Arc<dyn MessageSink>,
    config: SyncConfig,

    /// One slot per conversation. Only used to make `open` idempotent; the
    /// lock is released before a slot is filled.
    registry: Mutex<HashMap<ConversationKey, Arc<HandleSlot>>>,
    next_handle_id: AtomicU64,
}

impl SyncEngine {
    pub fn new(
        local_user: UserId,
        source: Arc<dyn ChangeSource>,
        sink: Arc<dyn MessageSink>,
        config: SyncConfig,
    ) -> Self {
        Self {
            local_user,
            source,
            sink,
            config,
            registry: Mutex::new(HashMap::new()),
            next_handle_id: AtomicU64::new(1),
        }
    }

    /// Engine over a backend that is both the change source and the sink
    pub fn with_backend<B>(local_user: UserId, backend: Arc<B>, config: SyncConfig) -> Self
    where
        B: ChangeSource + MessageSink + 'static,
    {
        Self::new(local_user, backend.clone(), backend, config)
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Open a conversation, or return the handle already open for `key`.
    ///
    /// Subscribes to both directions (`self -> peer` and `peer -> self`). If
    /// the second subscription fails the first is cancelled again.
    pub async fn open(&self, key: ConversationKey) -> SyncResult<ConversationHandle> {
        let peer = key
            .peer_of(&self.local_user)
            .cloned()
            .ok_or_else(|| SyncError::NotAParticipant {
                user: self.local_user.clone(),
                conversation: key.clone(),
            })?;

        let slot = {
            let mut registry = self.registry.lock().await;
            match registry.get(&key) {
                Some(slot) if slot.get().map_or(true, |handle| !handle.is_closed()) => slot.clone(),
                _ => {
                    let slot = Arc::new(HandleSlot::new());
                    registry.insert(key.clone(), slot.clone());
                    slot
                }
            }
        };

        if let Some(existing) = slot.get() {
            debug!(conversation = %key, handle = existing.id(), "Reusing open conversation");
            return Ok(existing.clone());
        }

        // Concurrent opens of the same key wait here; other keys are not blocked
        let handle = slot
            .get_or_try_init(|| self.connect(key.clone(), peer))
            .await?
            .clone();

        let registry = self.registry.lock().await;
        record_gauge(HANDLES_OPEN, live_handles(&registry) as f64);
        Ok(handle)
    }

    /// Subscribe to both directions and start the handle's worker. If the
    /// second subscription fails the first is cancelled again.
    async fn connect(&self, key: ConversationKey, peer: UserId) -> SyncResult<ConversationHandle> {
        let outgoing = SourceFilter::new(self.local_user.clone(), peer.clone());
        let incoming = SourceFilter::new(peer.clone(), self.local_user.clone());

        let outgoing_sub = self
            .source
            .subscribe(outgoing.clone())
            .await
            .map_err(|e| SyncError::subscribe(&outgoing, e))?;

        let incoming_sub = match self.source.subscribe(incoming.clone()).await {
            Ok(sub) => sub,
            Err(e) => {
                if let Err(cleanup) = self.source.unsubscribe(outgoing_sub.id).await {
                    warn!(subscription = %outgoing_sub.id, error = %cleanup, "Failed to cancel subscription after open failure");
                }
                return Err(SyncError::subscribe(&incoming, e));
            }
        };

        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConversationHandle::spawn(
            id,
            key.clone(),
            self.local_user.clone(),
            peer,
            vec![outgoing_sub, incoming_sub],
            &self.config,
        );
        info!(conversation = %key, handle = id, local_user = %self.local_user, "Conversation opened");

        Ok(handle)
    }

    /// Attach a listener; it first receives the current sequence
    pub async fn subscribe(
        &self,
        handle: &ConversationHandle,
        listener: Arc<dyn ConversationListener>,
    ) -> SyncResult<ListenerId> {
        handle.subscribe(listener).await
    }

    pub async fn unsubscribe(&self, handle: &ConversationHandle, id: ListenerId) -> SyncResult<bool> {
        handle.unsubscribe(id).await
    }

    pub async fn snapshot(&self, handle: &ConversationHandle) -> SyncResult<Vec<Message>> {
        handle.snapshot().await
    }

    /// Close a conversation. No listener callback happens after this returns.
    ///
    /// Closing an already closed handle does nothing.
    pub async fn close(&self, handle: &ConversationHandle) {
        {
            let mut registry = self.registry.lock().await;
            let registered = registry
                .get(handle.key())
                .and_then(|slot| slot.get())
                .map(|h| h.id());
            if registered == Some(handle.id()) {
                registry.remove(handle.key());
                record_gauge(HANDLES_OPEN, live_handles(&registry) as f64);
            }
        }

        let Some(subscriptions) = handle.shutdown(self.config.close_timeout).await else {
            return;
        };

        for id in subscriptions {
            if let Err(e) = self.source.unsubscribe(id).await {
                debug!(subscription = %id, error = %e, "Unsubscribe on close failed");
            }
        }
        info!(conversation = %handle.key(), handle = handle.id(), "Conversation closed");
    }

    /// Write a message from the local user to the handle's peer.
    ///
    /// The message is not inserted locally; it shows up once the outgoing
    /// subscription delivers it. Failures are returned, never retried.
    pub async fn send(&self, handle: &ConversationHandle, body: &str) -> SyncResult<MessageId> {
        if handle.is_closed() {
            return Err(handle.closed_error());
        }

        match self
            .sink
            .write(&self.local_user, handle.peer(), body, Timestamp::now())
            .await
        {
            Ok(id) => {
                record_counter(MESSAGES_SENT, 1);
                debug!(conversation = %handle.key(), message_id = %id, "Message sent");
                Ok(id)
            }
            Err(e) => {
                record_counter(SEND_FAILED, 1);
                warn!(conversation = %handle.key(), error = %e, "Send failed");
                Err(SyncError::send_failed(e))
            }
        }
    }

    pub async fn open_handles(&self) -> usize {
        live_handles(&*self.registry.lock().await)
    }

    /// Close every open conversation
    pub async fn shutdown(&self) {
        let handles: Vec<ConversationHandle> = {
            let registry = self.registry.lock().await;
            registry.values().filter_map(|slot| slot.get().cloned()).collect()
        };

        info!(handles = handles.len(), "Shutting down sync engine");
        for handle in handles {
            self.close(&handle).await;
        }
    }
}
