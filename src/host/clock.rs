use super::Clock;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// [`Clock`] backed by `tokio::time`.
///
/// Honors a paused tokio clock, which is how the tests drive timers deterministically.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
