/*
    handle.rs - One open conversation and its worker

    Each handle owns a single worker task, which is the only writer of the
    conversation state:

        subscriptions ──► StreamMerger ──► merged events ─┐
                                                          ├──► worker ──► listeners
        handle API ─────► commands ───────────────────────┘

    Commands (subscribe, unsubscribe, snapshot) and source events go
    through the same loop, so listeners see one gap-free sequence of diffs.
    The `closed` flag is set before the worker is stopped and checked before
    every callback.
*/

use super::errors::{SyncError, SyncResult};
use super::listener::{ConversationListener, ListenerId};
use crate::config::SyncConfig;
use crate::core_model::{ConversationKey, Diff, Message, RawEvent, SourceNotification, UserId};
use crate::core_source::{MergedEvent, StreamMerger, Subscription, SubscriptionId};
use crate::core_store::ConversationStore;
use crate::metrics::{
    record_counter, Timer, APPLY_DURATION_MS, EVENTS_APPLIED, EVENTS_DUPLICATE, EVENTS_MALFORMED,
    SOURCE_UNAVAILABLE,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub(crate) enum HandleCommand {
    Subscribe {
        listener: Arc<dyn ConversationListener>,
        reply: oneshot::Sender<ListenerId>,
    },
    Unsubscribe {
        id: ListenerId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Message>>,
    },
}

struct Lifecycle {
    shutdown: oneshot::Sender<()>,
    worker: JoinHandle<()>,
    subscriptions: Vec<SubscriptionId>,
}

struct HandleInner {
    id: u64,
    key: ConversationKey,
    local_user: UserId,
    peer: UserId,
    commands: mpsc::Sender<HandleCommand>,
    closed: Arc<AtomicBool>,

    /// `None` once closed. Held for the whole of `shutdown`.
    lifecycle: Mutex<Option<Lifecycle>>,
}

/// Cheap, cloneable reference to an open conversation
#[derive(Clone)]
pub struct ConversationHandle {
    inner: Arc<HandleInner>,
}

impl ConversationHandle {
    /// Merge the subscriptions and start the worker
    pub(crate) fn spawn(
        id: u64,
        key: ConversationKey,
        local_user: UserId,
        peer: UserId,
        subscriptions: Vec<Subscription>,
        config: &SyncConfig,
    ) -> Self {
        let subscription_ids = subscriptions.iter().map(|s| s.id).collect();
        let receivers = subscriptions.into_iter().map(|s| s.notifications).collect();
        let (merger, events) = StreamMerger::merge(receivers, config.merged_buffer);

        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let closed = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            key: key.clone(),
            local_user: local_user.clone(),
            store: ConversationStore::new(key.clone()),
            listeners: Vec::new(),
            next_listener: 0,
            closed: closed.clone(),
        };
        let task = tokio::spawn(worker.run(commands_rx, events, shutdown_rx, merger));

        Self {
            inner: Arc::new(HandleInner {
                id,
                key,
                local_user,
                peer,
                commands: commands_tx,
                closed,
                lifecycle: Mutex::new(Some(Lifecycle {
                    shutdown: shutdown_tx,
                    worker: task,
                    subscriptions: subscription_ids,
                })),
            }),
        }
    }

    /// Engine-unique handle number
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn key(&self) -> &ConversationKey {
        &self.inner.key
    }

    pub fn local_user(&self) -> &UserId {
        &self.inner.local_user
    }

    pub fn peer(&self) -> &UserId {
        &self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Register a listener. It gets `on_snapshot` before any diff.
    pub async fn subscribe(&self, listener: Arc<dyn ConversationListener>) -> SyncResult<ListenerId> {
        self.request(|reply| HandleCommand::Subscribe { listener, reply }).await
    }

    /// Stop delivering to one listener. Returns false if it was not registered.
    pub async fn unsubscribe(&self, id: ListenerId) -> SyncResult<bool> {
        self.request(|reply| HandleCommand::Unsubscribe { id, reply }).await
    }

    /// Copy of the current ordered sequence
    pub async fn snapshot(&self) -> SyncResult<Vec<Message>> {
        self.request(|reply| HandleCommand::Snapshot { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HandleCommand,
    ) -> SyncResult<T> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .commands
            .send(build(reply_tx))
            .await
            .map_err(|_| self.closed_error())?;
        reply_rx.await.map_err(|_| self.closed_error())
    }

    pub(crate) fn closed_error(&self) -> SyncError {
        SyncError::HandleClosed(self.inner.key.to_string())
    }

    /// Fence callbacks, stop the worker and hand back the subscriptions to
    /// cancel. `None` if the handle was already closed.
    ///
    /// Concurrent callers wait for the first one to finish.
    pub(crate) async fn shutdown(&self, close_timeout: Duration) -> Option<Vec<SubscriptionId>> {
        self.inner.closed.store(true, Ordering::SeqCst);

        let mut guard = self.inner.lifecycle.lock().await;
        let lifecycle = guard.take()?;

        let _ = lifecycle.shutdown.send(());
        let mut worker = lifecycle.worker;
        match tokio::time::timeout(close_timeout, &mut worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(conversation = %self.inner.key, error = %e, "Conversation worker ended abnormally"),
            Err(_) => {
                warn!(
                    conversation = %self.inner.key,
                    timeout_ms = close_timeout.as_millis() as u64,
                    "Conversation worker did not stop in time, aborting"
                );
                worker.abort();
            }
        }

        Some(lifecycle.subscriptions)
    }
}

impl std::fmt::Debug for ConversationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationHandle")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct Worker {
    key: ConversationKey,
    local_user: UserId,
    store: ConversationStore,
    listeners: Vec<(ListenerId, Arc<dyn ConversationListener>)>,
    next_listener: u64,
    closed: Arc<AtomicBool>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<HandleCommand>,
        mut events: mpsc::Receiver<MergedEvent>,
        mut shutdown: oneshot::Receiver<()>,
        merger: StreamMerger,
    ) {
        debug!(conversation = %self.key, local_user = %self.local_user, "Conversation worker started");
        let mut sources_done = false;

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                event = events.recv(), if !sources_done => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        debug!(conversation = %self.key, "All change sources ended");
                        sources_done = true;
                    }
                },
            }
        }

        merger.abort();
        debug!(
            conversation = %self.key,
            messages = self.store.len(),
            "Conversation worker stopped"
        );
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn handle_command(&mut self, command: HandleCommand) {
        match command {
            HandleCommand::Subscribe { listener, reply } => {
                if self.is_closed() {
                    return;
                }
                self.next_listener += 1;
                let id = ListenerId(self.next_listener);
                listener.on_snapshot(self.store.messages());
                self.listeners.push((id, listener));
                debug!(conversation = %self.key, listener = %id, "Listener subscribed");
                let _ = reply.send(id);
            }
            HandleCommand::Unsubscribe { id, reply } => {
                let before = self.listeners.len();
                self.listeners.retain(|(listener_id, _)| *listener_id != id);
                let _ = reply.send(self.listeners.len() != before);
            }
            HandleCommand::Snapshot { reply } => {
                let _ = reply.send(self.store.messages().to_vec());
            }
        }
    }

    fn handle_event(&mut self, event: MergedEvent) {
        match event.notification {
            SourceNotification::Batch(batch) => self.apply_batch(event.source_index, &batch),
            SourceNotification::Unavailable { reason } => {
                warn!(
                    conversation = %self.key,
                    source_index = event.source_index,
                    reason = %reason,
                    "Change source unavailable"
                );
                record_counter(SOURCE_UNAVAILABLE, 1);

                let error = SyncError::SourceUnavailable {
                    source_index: event.source_index,
                    reason,
                };
                for (_, listener) in &self.listeners {
                    if self.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    listener.on_source_error(&error);
                }
            }
        }
    }

    fn apply_batch(&mut self, source_index: usize, batch: &[RawEvent]) {
        let timer = Timer::new(APPLY_DURATION_MS);

        for raw in batch {
            if self.is_closed() {
                return;
            }
            match self.store.apply(raw) {
                Ok(diff) if diff.is_empty() => {
                    record_counter(EVENTS_DUPLICATE, 1);
                    trace!(conversation = %self.key, source_index, kind = %raw.kind, "No-op change event");
                }
                Ok(diff) => {
                    record_counter(EVENTS_APPLIED, 1);
                    debug!(conversation = %self.key, source_index, kind = %raw.kind, ops = diff.len(), "Applied change event");
                    self.notify_diff(&diff);
                }
                Err(e) => {
                    record_counter(EVENTS_MALFORMED, 1);
                    warn!(conversation = %self.key, source_index, error = %e, "Discarding change event");
                }
            }
        }

        timer.stop();
    }

    fn notify_diff(&self, diff: &Diff) {
        for (_, listener) in &self.listeners {
            if self.is_closed() {
                return;
            }
            listener.on_diff(diff);
        }
    }
}
