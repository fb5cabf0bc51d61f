use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Interaction events a page can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    KeyDown,
    PointerMove,
    PointerDown,
    Wheel,
    Scroll,
    Touch,
}

impl ActivityKind {
    /// Kinds that count as the user interacting with the page.
    pub const USER_ACTIVITY: [ActivityKind; 4] = [
        ActivityKind::KeyDown,
        ActivityKind::PointerMove,
        ActivityKind::PointerDown,
        ActivityKind::Wheel,
    ];
}

const CHANNEL_CAPACITY: usize = 64;

/// Broadcast bus of interaction events.
///
/// Every subscriber is one listener; dropping the receiver removes it.
#[derive(Debug, Clone)]
pub struct ActivityBus {
    tx: broadcast::Sender<ActivityKind>,
}

impl ActivityBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Deliver an event to the current listeners. Returns how many saw it.
    pub fn emit(&self, kind: ActivityKind) -> usize {
        self.tx.send(kind).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivityKind> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ActivityBus {
    fn default() -> Self {
        Self::new()
    }
}
