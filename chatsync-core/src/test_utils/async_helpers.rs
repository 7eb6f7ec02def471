//! Async test helpers
//!
//! Channel receive with timeouts, draining, and polling a condition.

use std::future::Future;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

/// Default timeout for tests (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Short timeout for tests that expect nothing to happen (100ms)
pub const SHORT_TEST_TIMEOUT: Duration = Duration::from_millis(100);

/// Very short timeout for race tests (10ms)
pub const VERY_SHORT_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    Closed,
}

impl std::fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvTimeoutError::Timeout => write!(f, "receive operation timed out"),
            RecvTimeoutError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}

/// Receive one value or fail after `duration`
pub async fn recv_timeout<T>(
    rx: &mut mpsc::Receiver<T>,
    duration: Duration,
) -> Result<T, RecvTimeoutError> {
    timeout(duration, rx.recv())
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
        .ok_or(RecvTimeoutError::Closed)
}

/// Receive exactly `count` values, each within `per_message_timeout`
pub async fn collect_n<T>(
    rx: &mut mpsc::Receiver<T>,
    count: usize,
    per_message_timeout: Duration,
) -> Result<Vec<T>, RecvTimeoutError> {
    let mut results = Vec::with_capacity(count);
    for _ in 0..count {
        results.push(recv_timeout(rx, per_message_timeout).await?);
    }
    Ok(results)
}

/// Take whatever is already queued without waiting
pub fn try_drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
    let mut results = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        results.push(msg);
    }
    results
}

/// Panic unless `future` completes within `duration`
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}

/// Poll `condition` until it holds. Returns false if `duration` runs out first.
pub async fn wait_until<F>(duration: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + duration;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
