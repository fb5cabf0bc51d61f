use super::{AdSlotConfig, AdStatus, SlotRenderer, StatusFeed};
use crate::error::LoadFailed;
use crate::host::{Clock, TokioClock};
use crate::service::LoadHandle;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Source of the refresh jitter, in `[0, 1)` seconds.
pub type Jitter = Arc<dyn Fn() -> f64 + Send + Sync>;

/// One ad slot and its retry/refresh schedule.
///
/// Cheap to clone; clones share the same state. Status changes, timers and change
/// notifications run on the tokio runtime, so mutating calls must be made from
/// within one.
#[derive(Clone)]
pub struct AdSlot {
    inner: Arc<SlotInner>,
}

struct SlotInner {
    id: String,
    config: AdSlotConfig,
    clock: Arc<dyn Clock>,
    renderer: Arc<dyn SlotRenderer>,
    jitter: Jitter,
    state: Mutex<SlotState>,
    changes: watch::Sender<AdStatus>,
    /// Cancelled when the slot goes away; stops feed attachments.
    detach: CancellationToken,
}

#[derive(Default)]
struct SlotState {
    status: AdStatus,
    retries: u32,
    last_width: u32,
    timer: Option<CancellationToken>,
}

impl SlotInner {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SlotInner {
    fn drop(&mut self) {
        self.detach.cancel();
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }
}

/// Settled status changes of one slot.
///
/// The receiver reads the slot's latest status when it looks, so writes made back to
/// back before that are coalesced into the last one, whichever threads run them. A
/// status equal to the last one seen is skipped.
pub struct StatusChanges {
    rx: watch::Receiver<AdStatus>,
    last: AdStatus,
}

impl StatusChanges {
    /// Next status that differs from the last one seen. `None` once the slot is gone.
    pub async fn recv(&mut self) -> Option<AdStatus> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(status) = self.take() {
                return Some(status);
            }
        }
    }

    /// Like [`StatusChanges::recv`], without waiting.
    pub fn try_recv(&mut self) -> Option<AdStatus> {
        match self.rx.has_changed() {
            Ok(true) => self.take(),
            _ => None,
        }
    }

    fn take(&mut self) -> Option<AdStatus> {
        let status = *self.rx.borrow_and_update();
        if status == self.last {
            None
        } else {
            self.last = status;
            Some(status)
        }
    }
}

pub struct AdSlotBuilder {
    id: String,
    config: AdSlotConfig,
    clock: Option<Arc<dyn Clock>>,
    renderer: Arc<dyn SlotRenderer>,
    jitter: Option<Jitter>,
}

impl AdSlotBuilder {
    pub fn with_config(mut self, config: AdSlotConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn build(self) -> AdSlot {
        let (changes, _) = watch::channel(AdStatus::Init);
        AdSlot {
            inner: Arc::new(SlotInner {
                id: self.id,
                config: self.config,
                clock: self.clock.unwrap_or_else(|| Arc::new(TokioClock)),
                renderer: self.renderer,
                jitter: self.jitter.unwrap_or_else(|| Arc::new(rand::random::<f64>)),
                state: Mutex::new(SlotState::default()),
                changes,
                detach: CancellationToken::new(),
            }),
        }
    }
}

impl AdSlot {
    pub fn builder(id: impl Into<String>, renderer: Arc<dyn SlotRenderer>) -> AdSlotBuilder {
        AdSlotBuilder {
            id: id.into(),
            config: AdSlotConfig::default(),
            clock: None,
            renderer,
            jitter: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &AdSlotConfig {
        &self.inner.config
    }

    pub fn status(&self) -> AdStatus {
        self.inner.state().status
    }

    /// Number of re-renders since the last reset.
    pub fn retries(&self) -> u32 {
        self.inner.state().retries
    }

    /// A re-render timer is armed.
    pub fn has_scheduled_render(&self) -> bool {
        self.inner.state().timer.is_some()
    }

    /// Settled status changes from now on, coalesced and never repeating a value.
    pub fn subscribe_changes(&self) -> StatusChanges {
        let rx = self.inner.changes.subscribe();
        let last = *rx.borrow();
        StatusChanges { rx, last }
    }

    /// First activation: `hidden` if the slot does not qualify, otherwise wait for the
    /// ad library and go `pending` (or `failed` when the library never loaded).
    ///
    /// Only acts on a slot still in `init`.
    pub async fn activate(&self, load: LoadHandle) {
        if self.status() != AdStatus::Init {
            tracing::debug!(slot = self.id(), "slot already activated");
            return;
        }
        if !self.inner.renderer.is_visible(self.id()) {
            self.apply(AdStatus::Hidden, Some(AdStatus::Init), true);
            return;
        }
        match load.await {
            Ok(()) => {
                if self.apply(AdStatus::Pending, Some(AdStatus::Init), true) {
                    self.inner.renderer.activate(self.id());
                }
            }
            Err(LoadFailed) => {
                self.apply(AdStatus::Failed, Some(AdStatus::Init), true);
            }
        }
    }

    /// Overwrite the status, as reported from outside, and re-plan the next render.
    ///
    /// Returns `false` when the status was already `status`.
    pub fn set_status(&self, status: AdStatus) -> bool {
        self.apply(status, None, true)
    }

    /// Hide the slot: reset retries and drop any pending re-render.
    pub fn hide(&self) {
        {
            let mut state = self.inner.state();
            state.retries = 0;
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
        }
        self.apply(AdStatus::Hidden, None, false);
    }

    /// Report the slot's current width. Returns whether a refresh was scheduled.
    ///
    /// The first width is only recorded as the baseline.
    pub fn observe_width(&self, width: u32) -> bool {
        let mut state = self.inner.state();
        let previous = std::mem::replace(&mut state.last_width, width);
        if previous == 0 || previous == width {
            return false;
        }
        if !self.inner.config.refresh_on_resize || state.status != AdStatus::Filled {
            return false;
        }
        state.retries = 0;
        self.schedule(&mut state, Duration::ZERO, "resize");
        true
    }

    /// Feed status events addressed to this slot into the state machine.
    ///
    /// The subscription is taken before this returns. The task ends as soon as the
    /// last clone of the slot is dropped or the feed closes; abort the handle to
    /// detach earlier.
    pub fn attach(&self, feed: &StatusFeed) -> JoinHandle<()> {
        let mut rx = feed.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let detach = self.inner.detach.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = detach.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { break };
                        if event.slot != inner.id {
                            continue;
                        }
                        if event.status == AdStatus::Init {
                            tracing::debug!(slot = event.slot.as_str(), "ignoring init status");
                            continue;
                        }
                        AdSlot { inner }.set_status(event.status);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "status feed lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn apply(&self, next: AdStatus, only_from: Option<AdStatus>, plan: bool) -> bool {
        let mut state = self.inner.state();
        if state.status == next || only_from.is_some_and(|from| state.status != from) {
            return false;
        }
        let previous = std::mem::replace(&mut state.status, next);
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        if plan {
            self.plan_next(&mut state);
        }
        self.inner.changes.send_replace(next);
        tracing::debug!(slot = self.id(), from = %previous, to = %next, "slot status changed");
        true
    }

    fn plan_next(&self, state: &mut SlotState) {
        let config = &self.inner.config;
        if state.status == AdStatus::Init {
            return;
        }
        if state.status.is_retry_path() {
            if config.retry_allowed(state.retries) {
                self.schedule(state, config.retry_delay, "retry");
            } else {
                tracing::debug!(slot = self.id(), retries = state.retries, "no retry scheduled");
            }
        } else if config.refresh_enabled() {
            let delay = config.refresh_interval + self.jitter();
            self.schedule(state, delay, "refresh");
        }
    }

    fn jitter(&self) -> Duration {
        let secs = (self.inner.jitter)();
        if secs.is_finite() {
            Duration::from_secs_f64(secs.clamp(0.0, 1.0))
        } else {
            Duration::ZERO
        }
    }

    /// Arm the re-render timer, replacing any armed one.
    fn schedule(&self, state: &mut SlotState, delay: Duration, reason: &'static str) {
        if let Some(previous) = state.timer.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        state.timer = Some(token.clone());
        tracing::debug!(
            slot = self.id(),
            reason,
            delay_ms = delay.as_millis() as u64,
            "re-render scheduled"
        );

        let weak = Arc::downgrade(&self.inner);
        let clock = self.inner.clock.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = clock.sleep(delay) => fire(weak, &token),
            }
        });
    }

    fn rerender(&self) {
        self.apply(AdStatus::Pending, None, true);
        let retries = {
            let mut state = self.inner.state();
            state.retries = state.retries.saturating_add(1);
            state.retries
        };
        tracing::info!(slot = self.id(), retries, "re-rendering slot");
        self.inner.renderer.restore_markup(self.id());
        self.inner.renderer.activate(self.id());
    }
}

fn fire(weak: Weak<SlotInner>, token: &CancellationToken) {
    let Some(inner) = weak.upgrade() else { return };
    {
        let mut state = inner.state();
        // Superseded while waking up.
        if token.is_cancelled() {
            return;
        }
        state.timer = None;
    }
    AdSlot { inner }.rerender();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::{RecordingRenderer, RenderCall};
    use futures::future::FutureExt;
    use tokio::time::sleep;

    fn slot_with(config: AdSlotConfig, renderer: Arc<RecordingRenderer>) -> AdSlot {
        AdSlot::builder("top", renderer)
            .with_config(config)
            .with_jitter(Arc::new(|| 0.0))
            .build()
    }

    fn retrying(count: u32) -> AdSlotConfig {
        AdSlotConfig::new()
            .with_retry_delay(Duration::from_secs(5))
            .with_retry_count(count)
    }

    fn loaded() -> LoadHandle {
        futures::future::ready(Ok(())).boxed().shared()
    }

    const PAST_RETRY: Duration = Duration::from_millis(5_001);

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_retries() {
        let renderer = Arc::new(RecordingRenderer::new());
        let slot = slot_with(retrying(0), renderer.clone());

        for round in 1..=6 {
            assert!(slot.set_status(AdStatus::Unfilled));
            assert!(slot.has_scheduled_render());
            sleep(PAST_RETRY).await;
            assert_eq!(slot.status(), AdStatus::Pending);
            assert_eq!(slot.retries(), round);
        }
        assert_eq!(renderer.activations("top"), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_count_is_a_hard_limit() {
        let renderer = Arc::new(RecordingRenderer::new());
        let slot = slot_with(retrying(2), renderer.clone());

        slot.set_status(AdStatus::Unfilled);
        sleep(PAST_RETRY).await;
        slot.set_status(AdStatus::Unfilled);
        sleep(PAST_RETRY).await;
        assert_eq!(slot.retries(), 2);

        slot.set_status(AdStatus::Unfilled);
        assert!(!slot.has_scheduled_render());
        sleep(Duration::from_secs(60)).await;
        assert_eq!(slot.status(), AdStatus::Unfilled);
        assert_eq!(renderer.activations("top"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerender_restores_markup_before_activation() {
        let renderer = Arc::new(RecordingRenderer::new());
        let slot = slot_with(retrying(1), renderer.clone());
        slot.set_status(AdStatus::Unfilled);
        sleep(PAST_RETRY).await;
        assert_eq!(
            renderer.calls(),
            vec![
                RenderCall::Restore("top".to_string()),
                RenderCall::Activate("top".to_string())
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_refresh_interval_never_refreshes() {
        let renderer = Arc::new(RecordingRenderer::new());
        let slot = slot_with(AdSlotConfig::new(), renderer.clone());
        for status in [
            AdStatus::Pending,
            AdStatus::Filled,
            AdStatus::Failed,
            AdStatus::Hidden,
        ] {
            slot.set_status(status);
            assert!(!slot.has_scheduled_render());
        }
        sleep(Duration::from_secs(3_600)).await;
        assert!(renderer.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_waits_interval_plus_jitter() {
        let renderer = Arc::new(RecordingRenderer::new());
        let slot = AdSlot::builder("top", renderer.clone())
            .with_config(AdSlotConfig::new().with_refresh_interval(Duration::from_secs(30)))
            .with_jitter(Arc::new(|| 0.5))
            .build();

        slot.set_status(AdStatus::Filled);
        sleep(Duration::from_millis(30_499)).await;
        assert_eq!(slot.status(), AdStatus::Filled);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(slot.status(), AdStatus::Pending);
        assert_eq!(slot.retries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfilled_ignores_refresh_and_filled_ignores_retry() {
        let renderer = Arc::new(RecordingRenderer::new());
        let config = AdSlotConfig::new()
            .with_retry_delay(Duration::from_secs(5))
            .with_refresh_interval(Duration::from_secs(60));
        let slot = slot_with(config, renderer.clone());

        slot.set_status(AdStatus::Unfilled);
        sleep(PAST_RETRY).await;
        assert_eq!(slot.status(), AdStatus::Pending);

        slot.set_status(AdStatus::Filled);
        sleep(PAST_RETRY).await;
        assert_eq!(slot.status(), AdStatus::Filled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_schedule_wins() {
        let renderer = Arc::new(RecordingRenderer::new());
        let config = retrying(0).with_refresh_interval(Duration::from_secs(30));
        let slot = slot_with(config, renderer.clone());

        slot.set_status(AdStatus::Unfilled);
        sleep(Duration::from_secs(2)).await;
        slot.set_status(AdStatus::Filled);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(slot.status(), AdStatus::Filled);
        assert_eq!(slot.retries(), 0);
        assert!(renderer.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_refresh() {
        let renderer = Arc::new(RecordingRenderer::new());
        let slot = slot_with(retrying(0).with_refresh_on_resize(true), renderer.clone());

        slot.set_status(AdStatus::Unfilled);
        sleep(PAST_RETRY).await;
        assert_eq!(slot.retries(), 1);
        slot.set_status(AdStatus::Filled);

        // First observation is the baseline, then unchanged widths are ignored.
        assert!(!slot.observe_width(300));
        assert!(!slot.observe_width(300));
        assert!(slot.observe_width(320));
        assert_eq!(slot.retries(), 0);

        sleep(Duration::from_millis(1)).await;
        assert_eq!(slot.status(), AdStatus::Pending);
        assert_eq!(slot.retries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_ignored_unless_filled_and_enabled() {
        let renderer = Arc::new(RecordingRenderer::new());
        let enabled = slot_with(AdSlotConfig::new().with_refresh_on_resize(true), renderer.clone());
        enabled.set_status(AdStatus::Pending);
        enabled.observe_width(300);
        assert!(!enabled.observe_width(320));

        let disabled = slot_with(AdSlotConfig::new(), renderer.clone());
        disabled.set_status(AdStatus::Filled);
        disabled.observe_width(300);
        assert!(!disabled.observe_width(320));
        assert!(!disabled.has_scheduled_render());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_status_is_a_no_op() {
        let slot = slot_with(AdSlotConfig::new(), Arc::new(RecordingRenderer::new()));
        let mut changes = slot.subscribe_changes();

        assert!(slot.set_status(AdStatus::Filled));
        assert_eq!(changes.recv().await.unwrap(), AdStatus::Filled);

        assert!(!slot.set_status(AdStatus::Filled));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(changes.try_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_notifications_are_coalesced() {
        let slot = slot_with(AdSlotConfig::new(), Arc::new(RecordingRenderer::new()));
        let mut changes = slot.subscribe_changes();

        slot.set_status(AdStatus::Filled);
        slot.set_status(AdStatus::Unfilled);
        assert_eq!(changes.recv().await.unwrap(), AdStatus::Unfilled);

        // A round trip back to the emitted value is not a change.
        slot.set_status(AdStatus::Filled);
        slot.set_status(AdStatus::Unfilled);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(changes.try_recv(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_back_to_back_writes_coalesce_on_any_worker() {
        for _ in 0..2_000 {
            let slot = slot_with(AdSlotConfig::new(), Arc::new(RecordingRenderer::new()));
            let mut changes = slot.subscribe_changes();

            slot.set_status(AdStatus::Filled);
            slot.set_status(AdStatus::Unfilled);
            tokio::task::yield_now().await;

            let mut seen = Vec::new();
            while let Some(status) = changes.try_recv() {
                seen.push(status);
            }
            assert_eq!(seen, vec![AdStatus::Unfilled]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_end_with_the_slot() {
        let slot = slot_with(AdSlotConfig::new(), Arc::new(RecordingRenderer::new()));
        let mut changes = slot.subscribe_changes();
        drop(slot);
        assert_eq!(changes.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_paths() {
        let renderer = Arc::new(RecordingRenderer::new().with_hidden("sidebar"));

        let top = slot_with(AdSlotConfig::new(), renderer.clone());
        top.activate(loaded()).await;
        assert_eq!(top.status(), AdStatus::Pending);
        assert_eq!(renderer.activations("top"), 1);

        // Second activation does nothing.
        top.activate(loaded()).await;
        assert_eq!(renderer.activations("top"), 1);

        let sidebar = AdSlot::builder("sidebar", renderer.clone()).build();
        sidebar.activate(loaded()).await;
        assert_eq!(sidebar.status(), AdStatus::Hidden);
        assert_eq!(renderer.activations("sidebar"), 0);

        let broken = AdSlot::builder("footer", renderer.clone()).build();
        broken
            .activate(futures::future::ready(Err(LoadFailed)).boxed().shared())
            .await;
        assert_eq!(broken.status(), AdStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hide_resets_and_cancels() {
        let renderer = Arc::new(RecordingRenderer::new());
        let slot = slot_with(retrying(0), renderer.clone());
        slot.set_status(AdStatus::Unfilled);
        sleep(PAST_RETRY).await;
        slot.set_status(AdStatus::Unfilled);

        slot.hide();
        assert_eq!(slot.status(), AdStatus::Hidden);
        assert_eq!(slot.retries(), 0);
        assert!(!slot.has_scheduled_render());
        sleep(Duration::from_secs(10)).await;
        assert_eq!(renderer.activations("top"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attached_feed_drives_status() {
        let feed = StatusFeed::new();
        feed.begin_observing();
        let slot = slot_with(AdSlotConfig::new(), Arc::new(RecordingRenderer::new()));
        let _task = slot.attach(&feed);

        feed.publish_raw("other", "filled");
        feed.publish_raw("top", "unfilled");
        sleep(Duration::from_millis(1)).await;
        assert_eq!(slot.status(), AdStatus::Unfilled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_slot_ends_feed_task() {
        let feed = StatusFeed::new();
        feed.begin_observing();
        let slot = slot_with(retrying(0), Arc::new(RecordingRenderer::new()));
        let task = slot.attach(&feed);
        slot.set_status(AdStatus::Unfilled);
        assert!(slot.has_scheduled_render());

        // No further feed event arrives; dropping the slot alone ends the task.
        drop(slot);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("feed task still running")
            .unwrap();
    }
}
