use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// What the slot state machine needs from the page.
pub trait SlotRenderer: Send + Sync {
    /// Whether visibility or media conditions allow the slot to be shown.
    fn is_visible(&self, _slot: &str) -> bool {
        true
    }

    /// Put the slot's original markup back before a re-render.
    fn restore_markup(&self, slot: &str);

    /// Ask the ad library to fill the slot.
    fn activate(&self, slot: &str);
}

/// One call made to a [`RecordingRenderer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderCall {
    Restore(String),
    Activate(String),
}

/// In-memory renderer for testing and simulation.
#[derive(Default)]
pub struct RecordingRenderer {
    hidden: RwLock<HashSet<String>>,
    calls: Arc<RwLock<Vec<RenderCall>>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `slot` as disqualified by visibility conditions.
    pub fn with_hidden(self, slot: impl Into<String>) -> Self {
        self.hidden.write().unwrap().insert(slot.into());
        self
    }

    pub fn calls(&self) -> Vec<RenderCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn activations(&self, slot: &str) -> usize {
        self.calls
            .read()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, RenderCall::Activate(s) if s == slot))
            .count()
    }
}

impl SlotRenderer for RecordingRenderer {
    fn is_visible(&self, slot: &str) -> bool {
        !self.hidden.read().unwrap().contains(slot)
    }

    fn restore_markup(&self, slot: &str) {
        self.calls
            .write()
            .unwrap()
            .push(RenderCall::Restore(slot.to_string()));
    }

    fn activate(&self, slot: &str) {
        self.calls
            .write()
            .unwrap()
            .push(RenderCall::Activate(slot.to_string()));
    }
}
