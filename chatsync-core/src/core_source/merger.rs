//! Stream Merger - fan-in of independent subscriptions
//!
//! ```text
//!  source 0 ──► forwarder 0 ──┐
//!                             ├──► merged channel ──► apply loop
//!  source 1 ──► forwarder 1 ──┘
//! ```
//!
//! One forwarding task per source keeps that source's order intact. Nothing
//! is promised about the interleaving across sources. A source that goes
//! quiet or ends never holds up the others, and the merged channel closes
//! only once every forwarder has finished.

use crate::core_model::SourceNotification;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A notification tagged with the index of the source it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedEvent {
    pub source_index: usize,
    pub notification: SourceNotification,
}

/// Owns the forwarding tasks. Dropping it stops them.
pub struct StreamMerger {
    forwarders: Vec<JoinHandle<()>>,
}

impl StreamMerger {
    /// Start forwarding every receiver into one channel of capacity `buffer`
    pub fn merge(
        sources: Vec<mpsc::Receiver<SourceNotification>>,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<MergedEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));

        let forwarders = sources
            .into_iter()
            .enumerate()
            .map(|(source_index, source)| tokio::spawn(forward(source_index, source, tx.clone())))
            .collect();

        (Self { forwarders }, rx)
    }

    /// Number of sources being forwarded
    pub fn source_count(&self) -> usize {
        self.forwarders.len()
    }

    /// Number of forwarders still running
    pub fn active_sources(&self) -> usize {
        self.forwarders.iter().filter(|h| !h.is_finished()).count()
    }

    /// Stop all forwarders; the merged channel then drains and closes
    pub fn abort(&self) {
        for handle in &self.forwarders {
            handle.abort();
        }
    }
}

impl Drop for StreamMerger {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn forward(
    source_index: usize,
    mut source: mpsc::Receiver<SourceNotification>,
    merged: mpsc::Sender<MergedEvent>,
) {
    while let Some(notification) = source.recv().await {
        trace!(source_index, "Forwarding source notification");
        let event = MergedEvent {
            source_index,
            notification,
        };
        if merged.send(event).await.is_err() {
            debug!(source_index, "Merged stream consumer gone, stopping forwarder");
            return;
        }
    }
    debug!(source_index, "Source stream ended");
}
