use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Retry and refresh policy of one ad slot. Durations are read and written as seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdSlotConfig {
    /// Delay before re-rendering an unfilled slot. Zero disables retries.
    #[serde(with = "seconds")]
    pub retry_delay: Duration,
    /// Maximum number of re-renders considered by the retry path. Zero means unlimited.
    pub retry_count: u32,
    /// Base delay before re-rendering a slot in any other status. Zero disables refresh.
    #[serde(with = "seconds")]
    pub refresh_interval: Duration,
    pub refresh_on_resize: bool,
}

impl AdSlotConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_refresh_on_resize(mut self, enabled: bool) -> Self {
        self.refresh_on_resize = enabled;
        self
    }

    /// Whether an unfilled slot that was re-rendered `retries` times may retry again.
    pub fn retry_allowed(&self, retries: u32) -> bool {
        !self.retry_delay.is_zero() && (self.retry_count == 0 || retries < self.retry_count)
    }

    pub fn refresh_enabled(&self) -> bool {
        !self.refresh_interval.is_zero()
    }
}

mod seconds {
    use super::*;
    use serde::de::Error as _;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
