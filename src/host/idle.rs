use super::{Clock, IdleDeadline, IdleScheduler};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// One rendered frame: `busy` work followed by an `idle` period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleFrame {
    pub busy: Duration,
    pub idle: Duration,
}

impl IdleFrame {
    pub const fn new(busy: Duration, idle: Duration) -> Self {
        Self { busy, idle }
    }

    pub const fn from_millis(busy: u64, idle: u64) -> Self {
        Self::new(Duration::from_millis(busy), Duration::from_millis(idle))
    }

    pub fn length(&self) -> Duration {
        self.busy + self.idle
    }
}

/// An idle page: almost no work, the longest idle period a browser hands out.
const IDLE_PAGE_FRAME: IdleFrame = IdleFrame::from_millis(1, 49);

#[derive(Debug)]
struct Timeline {
    script: VecDeque<IdleFrame>,
    next_frame_start: Option<Instant>,
}

/// [`IdleScheduler`] that plays back a frame cadence on a [`Clock`].
///
/// Scripted frames are consumed in order; afterwards the fallback frame repeats
/// forever. A callback fires once the busy part of its frame is over and reports
/// the idle part as remaining. Frames never overlap: a request made mid-frame
/// waits for the next one.
pub struct SimulatedIdleScheduler {
    clock: Arc<dyn Clock>,
    fallback: IdleFrame,
    timeline: Mutex<Timeline>,
}

impl SimulatedIdleScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            fallback: IDLE_PAGE_FRAME,
            timeline: Mutex::new(Timeline {
                script: VecDeque::new(),
                next_frame_start: None,
            }),
        }
    }

    pub fn with_frames(self, frames: impl IntoIterator<Item = IdleFrame>) -> Self {
        self.lock().script.extend(frames);
        self
    }

    /// Frame repeated once the script runs out.
    pub fn then_repeat(mut self, frame: IdleFrame) -> Self {
        self.fallback = frame;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl IdleScheduler for SimulatedIdleScheduler {
    async fn request_idle(&self, timeout: Duration) -> IdleDeadline {
        let requested = self.clock.now();
        let deadline_at = requested + timeout;

        let outcome = {
            let mut timeline = self.lock();
            let frame = timeline.script.pop_front().unwrap_or(self.fallback);
            let start = timeline
                .next_frame_start
                .map_or(requested, |next| next.max(requested));
            let callback_at = start + frame.busy;
            if callback_at > deadline_at {
                timeline.script.push_front(frame);
                None
            } else {
                timeline.next_frame_start = Some(callback_at + frame.idle);
                Some((callback_at, frame.idle))
            }
        };

        match outcome {
            Some((callback_at, idle)) => {
                let wait = callback_at.saturating_duration_since(self.clock.now());
                self.clock.sleep(wait).await;
                IdleDeadline {
                    time_remaining: idle,
                    did_timeout: false,
                }
            }
            None => {
                let wait = deadline_at.saturating_duration_since(self.clock.now());
                self.clock.sleep(wait).await;
                IdleDeadline {
                    time_remaining: Duration::ZERO,
                    did_timeout: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TokioClock;

    #[tokio::test(start_paused = true)]
    async fn test_callback_fires_after_busy_part() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let scheduler = SimulatedIdleScheduler::new(clock.clone())
            .with_frames([IdleFrame::from_millis(2, 18)]);

        let start = clock.now();
        let deadline = scheduler.request_idle(Duration::from_secs(1)).await;
        assert_eq!(deadline.time_remaining, Duration::from_millis(18));
        assert!(!deadline.did_timeout);
        assert_eq!(clock.now() - start, Duration::from_millis(2));

        // Next request waits for the frame to end, then uses the fallback cadence.
        let deadline = scheduler.request_idle(Duration::from_secs(1)).await;
        assert_eq!(deadline.time_remaining, Duration::from_millis(49));
        assert_eq!(clock.now() - start, Duration::from_millis(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_frame_is_too_busy() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let scheduler = SimulatedIdleScheduler::new(clock.clone())
            .with_frames([IdleFrame::from_millis(500, 10)]);

        let start = clock.now();
        let deadline = scheduler.request_idle(Duration::from_millis(100)).await;
        assert!(deadline.did_timeout);
        assert_eq!(deadline.time_remaining, Duration::ZERO);
        assert_eq!(clock.now() - start, Duration::from_millis(100));
    }
}
