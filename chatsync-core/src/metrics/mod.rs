//! Sync engine metrics
//!
//! Emitted through the `metrics` facade; without an installed recorder
//! every call is a no-op. Names are the `pub const`s below.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

pub const EVENTS_APPLIED: &str = "sync.events.applied";
pub const EVENTS_DUPLICATE: &str = "sync.events.duplicate";
pub const EVENTS_MALFORMED: &str = "sync.events.malformed";
pub const SOURCE_UNAVAILABLE: &str = "sync.source.unavailable";
pub const MESSAGES_SENT: &str = "sync.messages.sent";
pub const SEND_FAILED: &str = "sync.send.failed";
pub const HANDLES_OPEN: &str = "sync.handles.open";
pub const APPLY_DURATION_MS: &str = "sync.apply.duration_ms";

/// Register descriptions for every metric the engine emits
pub fn init_metrics() {
    describe_counter!(EVENTS_APPLIED, "Change events that altered a conversation");
    describe_counter!(EVENTS_DUPLICATE, "Change events that were redeliveries or no-ops");
    describe_counter!(EVENTS_MALFORMED, "Change events rejected as malformed or foreign");
    describe_counter!(SOURCE_UNAVAILABLE, "Outage notifications received from change sources");
    describe_counter!(MESSAGES_SENT, "Messages accepted by the sink");
    describe_counter!(SEND_FAILED, "Sends rejected by the sink");
    describe_gauge!(HANDLES_OPEN, "Conversation handles currently open");
    describe_histogram!(APPLY_DURATION_MS, "Time to apply one source batch in milliseconds");
}

pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

/// Records elapsed milliseconds into a histogram when stopped
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Record the duration and return it in milliseconds
    pub fn stop(self) -> f64 {
        let millis = self.start.elapsed().as_secs_f64() * 1000.0;
        histogram!(self.name).record(millis);
        millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        init_metrics();
        record_counter(EVENTS_APPLIED, 1);
        record_gauge(HANDLES_OPEN, 2.0);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new(APPLY_DURATION_MS);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.stop() >= 5.0);
    }
}
