use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a send loop does after a transport error.
///
/// The default retries forever with no pause, which drives the broker at
/// saturation. `max_retries` bounds consecutive failures; a success resets
/// the count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Consecutive transport errors tolerated before the loop gives up
    pub max_retries: Option<u32>,
    /// Pause before each retry in milliseconds
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn backoff(&self) -> Option<Duration> {
        (self.backoff_ms > 0).then(|| Duration::from_millis(self.backoff_ms))
    }

    /// Whether another attempt is allowed after `consecutive_failures` errors in a row.
    pub fn should_retry(&self, consecutive_failures: u32) -> bool {
        match self.max_retries {
            Some(max) => consecutive_failures <= max,
            None => true,
        }
    }
}
