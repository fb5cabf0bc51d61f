use super::AdStatus;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const FEED_CAPACITY: usize = 256;

/// Externally observed status of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStatusEvent {
    pub slot: String,
    pub status: AdStatus,
}

impl SlotStatusEvent {
    pub fn new(slot: impl Into<String>, status: AdStatus) -> Self {
        Self {
            slot: slot.into(),
            status,
        }
    }
}

/// Stream of raw status events coming from the page.
///
/// Closed until [`StatusFeed::begin_observing`]; events published before that are
/// dropped, the same way nothing is observed before the ad library is on the page.
/// Slots consume the feed through [`super::AdSlot::attach`]; analytics consumers may
/// [`StatusFeed::subscribe`] directly.
#[derive(Clone)]
pub struct StatusFeed {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    tx: broadcast::Sender<SlotStatusEvent>,
    observing: AtomicBool,
}

impl StatusFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(FeedInner {
                tx,
                observing: AtomicBool::new(false),
            }),
        }
    }

    /// Start forwarding events. Returns `true` for the call that opened the feed.
    pub fn begin_observing(&self) -> bool {
        !self.inner.observing.swap(true, Ordering::AcqRel)
    }

    pub fn is_observing(&self) -> bool {
        self.inner.observing.load(Ordering::Acquire)
    }

    /// Forward an event to all subscribers. Returns the number of receivers reached.
    pub fn publish(&self, event: SlotStatusEvent) -> usize {
        if !self.is_observing() {
            tracing::trace!(slot = event.slot.as_str(), "status feed closed, event dropped");
            return 0;
        }
        self.inner.tx.send(event).unwrap_or(0)
    }

    /// Publish a status given as the page reports it. Unknown values are ignored.
    pub fn publish_raw(&self, slot: &str, status: &str) -> usize {
        match status.parse::<AdStatus>() {
            Ok(status) => self.publish(SlotStatusEvent::new(slot, status)),
            Err(_) => {
                tracing::debug!(slot, status, "ignoring unknown slot status");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SlotStatusEvent> {
        self.inner.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

impl Default for StatusFeed {
    fn default() -> Self {
        Self::new()
    }
}
