/*
    Close race tests

    Writers keep producing events while `close` runs. The listener carries a
    fence that is raised the moment `close` returns; any callback that
    starts afterwards is counted as a violation.
*/

use chatsync_core::config::SyncConfig;
use chatsync_core::core_model::{Diff, Message, Timestamp, UserId};
use chatsync_core::core_source::{InMemoryMessageStore, MessageSink};
use chatsync_core::core_sync::{ConversationListener, SyncEngine};
use chatsync_core::test_utils::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn spawn_writer(
    store: Arc<InMemoryMessageStore>,
    sender: &'static str,
    receiver: &'static str,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let (sender, receiver) = (UserId::from(sender), UserId::from(receiver));
        let mut written = 0;
        while !stop.load(Ordering::SeqCst) {
            store
                .write(&sender, &receiver, "race", Timestamp(written as u64))
                .await
                .unwrap();
            written += 1;
            tokio::task::yield_now().await;
        }
        written
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_callback_after_close_under_load() {
    for round in 0..40u64 {
        let store = Arc::new(InMemoryMessageStore::new(16));
        let engine = SyncEngine::with_backend("alice".into(), store.clone(), SyncConfig::default());
        let handle = engine.open(conversation("alice", "bob")).await.unwrap();

        let fence = Arc::new(AtomicBool::new(false));
        let listener = RecordingListener::with_fence(fence.clone());
        engine.subscribe(&handle, listener.clone()).await.unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let writers = vec![
            spawn_writer(store.clone(), "alice", "bob", stop.clone()),
            spawn_writer(store.clone(), "bob", "alice", stop.clone()),
        ];

        // Vary where in the stream the close lands
        tokio::time::sleep(Duration::from_micros(200 * (round % 10))).await;
        engine.close(&handle).await;
        fence.store(true, Ordering::SeqCst);

        tokio::time::sleep(VERY_SHORT_TIMEOUT).await;
        stop.store(true, Ordering::SeqCst);
        for writer in writers {
            writer.await.unwrap();
        }

        assert_eq!(listener.violations(), 0, "callback after close in round {}", round);
        assert_eq!(store.subscriber_count().await, 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_close_calls() {
    let store = Arc::new(InMemoryMessageStore::new(16));
    let engine = Arc::new(SyncEngine::with_backend("alice".into(), store.clone(), SyncConfig::default()));
    let handle = engine.open(conversation("alice", "bob")).await.unwrap();

    let fence = Arc::new(AtomicBool::new(false));
    let listener = RecordingListener::with_fence(fence.clone());
    engine.subscribe(&handle, listener.clone()).await.unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let writer = spawn_writer(store.clone(), "bob", "alice", stop.clone());
    tokio::time::sleep(VERY_SHORT_TIMEOUT).await;

    // Every closer raises the fence only after its own close returned
    let closers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let handle = handle.clone();
            let fence = fence.clone();
            tokio::spawn(async move {
                engine.close(&handle).await;
                fence.store(true, Ordering::SeqCst);
            })
        })
        .collect();
    for closer in futures::future::join_all(closers).await {
        closer.unwrap();
    }

    tokio::time::sleep(VERY_SHORT_TIMEOUT).await;
    stop.store(true, Ordering::SeqCst);
    writer.await.unwrap();

    assert_eq!(listener.violations(), 0);
    assert_eq!(engine.open_handles().await, 0);
}

/// Listener that blocks inside `on_diff` long enough to outlast `close_timeout`
struct SlowListener {
    fence: Arc<AtomicBool>,
    entered: AtomicUsize,
    violations: AtomicUsize,
}

impl ConversationListener for SlowListener {
    fn on_snapshot(&self, _messages: &[Message]) {}

    fn on_diff(&self, _diff: &Diff) {
        if self.fence.load(Ordering::SeqCst) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.entered.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_times_out_on_stuck_listener() {
    let store = Arc::new(InMemoryMessageStore::new(16));
    let config = SyncConfig {
        close_timeout: Duration::from_millis(10),
        ..SyncConfig::default()
    };
    let engine = SyncEngine::with_backend("alice".into(), store.clone(), config);
    let handle = engine.open(conversation("alice", "bob")).await.unwrap();

    let fence = Arc::new(AtomicBool::new(false));
    let listener = Arc::new(SlowListener {
        fence: fence.clone(),
        entered: AtomicUsize::new(0),
        violations: AtomicUsize::new(0),
    });
    engine.subscribe(&handle, listener.clone()).await.unwrap();

    for i in 0..5u64 {
        store.write(&"bob".into(), &"alice".into(), "slow", Timestamp(i)).await.unwrap();
    }
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || listener.entered.load(Ordering::SeqCst) >= 1).await);

    assert_completes_within(Duration::from_secs(1), engine.close(&handle)).await;
    fence.store(true, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(listener.violations.load(Ordering::SeqCst), 0);
    assert!(listener.entered.load(Ordering::SeqCst) < 5);
}
