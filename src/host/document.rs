use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Document ready state, ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
}

/// Observable document ready state.
///
/// Clones share the same underlying state.
#[derive(Debug, Clone)]
pub struct DocumentReadiness {
    tx: Arc<watch::Sender<ReadyState>>,
}

impl DocumentReadiness {
    pub fn new(initial: ReadyState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ReadyState {
        *self.tx.borrow()
    }

    /// Move to `state`. Ready state never goes backwards; returns whether it changed.
    pub fn advance(&self, state: ReadyState) -> bool {
        self.tx.send_if_modified(|current| {
            if state > *current {
                *current = state;
                true
            } else {
                false
            }
        })
    }

    /// Resolve once the document has reached at least `state`.
    pub async fn wait_until(&self, state: ReadyState) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|current| *current >= state).await;
    }
}

impl Default for DocumentReadiness {
    fn default() -> Self {
        Self::new(ReadyState::Loading)
    }
}
