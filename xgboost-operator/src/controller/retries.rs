//! Per-job retry history.
//!
//! Every rate-limited requeue of a job key is counted until the key is
//! forgotten. The count is the "previous retry" figure compared against
//! `backoffLimit`, and it sets the exponential delay of the next requeue.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Delay of the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Upper bound of the retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Retry counts of job keys with exponential backoff.
#[derive(Debug)]
pub struct Retries {
    counts: Mutex<HashMap<String, u32>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for Retries {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl Retries {
    /// Create a tracker doubling from `base_delay` up to `max_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `retries` (1-based).
    pub fn delay(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Count a retry of `key` and return how long to wait before it.
    pub fn requeue(&self, key: &str) -> Duration {
        let retries = {
            let mut counts = self.counts.lock();
            let count = counts.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        self.delay(retries)
    }

    /// Drop the retry history of `key`.
    pub fn forget(&self, key: &str) {
        self.counts.lock().remove(key);
    }

    /// Retries of `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }
}
