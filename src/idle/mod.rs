//! 空闲估计：从逐帧空闲回调样本中推导“浏览器已足够空闲”的判断。
//!
//! # Idle Estimator
//!
//! Idle callbacks are noisy: a single long idle period says little, and very short
//! frames are mostly scheduling jitter. The estimator keeps a sliding window of the
//! last three usable frames and declares the page idle once the idle credit in that
//! window reaches a threshold.
//!
//! A frame is classified from two consecutive callbacks:
//!
//! - its length is the distance between the projected frame ends
//!   (`callback time + time remaining`) of the previous and current callback
//! - frames shorter than [`NOISE_FRAME_LENGTH`] are ignored entirely
//! - otherwise the frame credits its idle time when `idle / length` is above
//!   [`IdleConfig::min_idle_ratio`], and zero when it is not
//!
//! The scheduler's own timeout, or running out of [`IdleConfig::overall_timeout`],
//! counts as idle: under sustained load the page is assumed idle rather than waiting
//! forever.

use crate::host::{Clock, IdleDeadline, IdleScheduler};
use crate::{Error, Result};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Frames shorter than this are treated as noise.
pub const NOISE_FRAME_LENGTH: Duration = Duration::from_millis(15);

/// Number of frames in the idle window.
pub const WINDOW_SLOTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdleConfig {
    /// Minimum share of a frame that must be idle for it to earn credit.
    pub min_idle_ratio: f64,
    /// Idle credit the window must accumulate.
    pub min_idle_duration: Duration,
    /// Give up waiting and report idle after this long.
    pub overall_timeout: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            min_idle_ratio: 0.9,
            min_idle_duration: Duration::from_micros(46_600),
            overall_timeout: Duration::from_secs(10),
        }
    }
}

impl IdleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_idle_ratio(mut self, ratio: f64) -> Self {
        self.min_idle_ratio = ratio;
        self
    }

    pub fn with_min_idle_duration(mut self, duration: Duration) -> Self {
        self.min_idle_duration = duration;
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }
}

/// Fixed three-slot ring of idle credit. Pushing evicts the oldest slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdleWindow {
    slots: [Duration; WINDOW_SLOTS],
    next: usize,
}

impl IdleWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, credit: Duration) {
        self.slots[self.next] = credit;
        self.next = (self.next + 1) % WINDOW_SLOTS;
    }

    pub fn total(&self) -> Duration {
        self.slots.iter().sum()
    }

    /// Slots from oldest to newest.
    pub fn slots(&self) -> [Duration; WINDOW_SLOTS] {
        let mut ordered = [Duration::ZERO; WINDOW_SLOTS];
        for (i, slot) in ordered.iter_mut().enumerate() {
            *slot = self.slots[(self.next + i) % WINDOW_SLOTS];
        }
        ordered
    }
}

/// How a single callback was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVerdict {
    /// Frame too short to say anything; the window is untouched.
    Noise,
    /// Frame pushed into the window with this much credit.
    Credited(Duration),
    /// The scheduler reported its own timeout.
    TimedOut,
}

/// Incremental idle estimator over a stream of idle callbacks.
#[derive(Debug, Clone)]
pub struct IdleEstimator {
    config: IdleConfig,
    window: IdleWindow,
    last_frame_end: Instant,
}

impl IdleEstimator {
    /// Start estimating; `started` acts as the end of the frame before the first callback.
    pub fn new(config: IdleConfig, started: Instant) -> Self {
        Self {
            config,
            window: IdleWindow::new(),
            last_frame_end: started,
        }
    }

    pub fn window(&self) -> &IdleWindow {
        &self.window
    }

    /// Classify one callback observed at `now`.
    pub fn classify(&mut self, now: Instant, deadline: IdleDeadline) -> FrameVerdict {
        if deadline.did_timeout {
            return FrameVerdict::TimedOut;
        }

        let frame_end = now + deadline.time_remaining;
        let frame_length = frame_end.saturating_duration_since(self.last_frame_end);
        self.last_frame_end = frame_end;
        if frame_length < NOISE_FRAME_LENGTH {
            return FrameVerdict::Noise;
        }

        let ratio = deadline.time_remaining.as_secs_f64() / frame_length.as_secs_f64();
        let credit = if ratio > self.config.min_idle_ratio {
            deadline.time_remaining
        } else {
            Duration::ZERO
        };
        self.window.push(credit);
        FrameVerdict::Credited(credit)
    }

    /// Feed one callback; returns whether the page now counts as idle.
    pub fn observe(&mut self, now: Instant, deadline: IdleDeadline) -> bool {
        match self.classify(now, deadline) {
            FrameVerdict::TimedOut => true,
            FrameVerdict::Noise => false,
            FrameVerdict::Credited(_) => self.window.total() >= self.config.min_idle_duration,
        }
    }
}

/// Wait until the page has been idle enough, or the overall timeout elapses.
///
/// Resolves `Ok(true)` in both cases. Fails with [`Error::Cancelled`] when `cancel`
/// fires first; no further callback is scheduled after that.
pub async fn observe_idle(
    scheduler: &dyn IdleScheduler,
    clock: &dyn Clock,
    config: IdleConfig,
    cancel: &CancellationToken,
) -> Result<bool> {
    let started = clock.now();
    let mut estimator = IdleEstimator::new(config, started);

    loop {
        let elapsed = clock.now().saturating_duration_since(started);
        if elapsed >= config.overall_timeout {
            tracing::debug!(
                elapsed_ms = elapsed.as_millis() as u64,
                "idle budget exhausted, assuming idle"
            );
            return Ok(true);
        }

        let deadline = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            deadline = scheduler.request_idle(config.overall_timeout - elapsed) => deadline,
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if estimator.observe(clock.now(), deadline) {
            tracing::debug!(
                window_ms = estimator.window().total().as_secs_f64() * 1000.0,
                did_timeout = deadline.did_timeout,
                "page is idle"
            );
            return Ok(true);
        }
    }
}
