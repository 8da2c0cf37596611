//! Sliding-window rate limiter (§4.P). Used by the fork monitor for
//! per-source fork-signal throttling, and generic enough for any other
//! per-key signal the platform wants to throttle the same way.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use vigil_types::{Timestamp, VigilError, VigilResult};

/// A sliding-window limiter over `threshold` events per `window` per
/// source key.
pub struct SlidingWindowLimiter {
    threshold: u32,
    window: Duration,
    timestamps: Mutex<HashMap<String, Vec<Timestamp>>>,
}

impl SlidingWindowLimiter {
    /// Construct a limiter allowing at most `threshold` recorded events
    /// per source within any `window`-long interval.
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            timestamps: Mutex::new(HashMap::new()),
        }
    }

    /// A limiter matching the fork-signal constants (§4.G: 3 per hour
    /// per source).
    pub fn for_fork_signals() -> Self {
        Self::new(vigil_types::FORK_SIGNAL_RATE_LIMIT, vigil_types::FORK_SIGNAL_RATE_WINDOW)
    }

    fn window_start(&self, now: Timestamp) -> Timestamp {
        now - chrono::Duration::from_std(self.window).expect("configured window fits in chrono::Duration")
    }

    /// Count of in-window timestamps for `source_id` as of `now`.
    pub fn count(&self, source_id: &str, now: Timestamp) -> u32 {
        let window_start = self.window_start(now);
        self.timestamps
            .lock()
            .get(source_id)
            .map(|ts| ts.iter().filter(|t| **t > window_start).count() as u32)
            .unwrap_or(0)
    }

    /// `true` iff `source_id` has not yet hit the threshold as of `now`.
    pub fn check(&self, source_id: &str, now: Timestamp) -> bool {
        self.count(source_id, now) < self.threshold
    }

    /// Record one event for `source_id` at `now`, trimming entries
    /// older than the window as a side effect.
    pub fn record(&self, source_id: &str, now: Timestamp) {
        let window_start = self.window_start(now);
        let mut map = self.timestamps.lock();
        let entry = map.entry(source_id.to_string()).or_default();
        entry.retain(|t| *t > window_start);
        entry.push(now);
    }

    /// Check-and-record in one call; returns `Ok(())` if `source_id` was
    /// under the threshold (and now recorded), or
    /// [`VigilError::RateLimited`] with a `retry_after_secs` hint
    /// otherwise.
    pub fn check_and_record(&self, source_id: &str, now: Timestamp) -> VigilResult<()> {
        if !self.check(source_id, now) {
            return Err(VigilError::RateLimited {
                retry_after_secs: self.retry_after(source_id, now),
            });
        }
        self.record(source_id, now);
        Ok(())
    }

    /// Seconds until the oldest in-window timestamp for `source_id`
    /// falls out of the window, i.e. until a new slot opens up.
    pub fn retry_after(&self, source_id: &str, now: Timestamp) -> u64 {
        let window_start = self.window_start(now);
        let oldest_in_window = self
            .timestamps
            .lock()
            .get(source_id)
            .and_then(|ts| ts.iter().filter(|t| **t > window_start).min().copied());
        match oldest_in_window {
            Some(oldest) => {
                let expiry = oldest + chrono::Duration::from_std(self.window).expect("window fits");
                (expiry - now).num_seconds().max(0) as u64
            }
            None => 0,
        }
    }
}
