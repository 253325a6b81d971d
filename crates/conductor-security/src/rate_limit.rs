use chrono::{DateTime, Utc};
use conductor_core::clock::elapsed_since;
use conductor_core::{Clock, ConductorError, ConductorResult, SystemClock};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sliding-window rate limiter keyed by caller id (agent id or submitter id).
///
/// Each key keeps the timestamps of its admitted requests inside the trailing
/// window. Calls never wait: the internal lock is only held for the few
/// operations needed to prune and count.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    /// Create a new rate limiter on the system clock.
    /// - `max_requests`: admissions allowed per window
    /// - `window`: length of the trailing window
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self::with_clock(max_requests, window, Arc::new(SystemClock))
    }

    /// Create a rate limiter reading time from `clock`.
    pub fn with_clock(max_requests: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_requests,
            window,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Try to admit one request for `key`.
    /// Returns `true` and records the request if allowed, `false` otherwise.
    pub fn allow(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let stamps = windows.entry(key.to_string()).or_default();
        prune(stamps, now, self.window);

        if stamps.len() < self.max_requests {
            stamps.push_back(now);
            true
        } else {
            debug!(key = %key, in_window = stamps.len(), "rate limit denied");
            false
        }
    }

    /// Like [`allow`](Self::allow) but reports a denial as
    /// [`ConductorError::RateLimitExceeded`] carrying the back-off delay.
    pub fn check(&self, key: &str) -> ConductorResult<()> {
        if self.allow(key) {
            Ok(())
        } else {
            Err(ConductorError::RateLimitExceeded {
                key: key.to_string(),
                retry_after: self.time_to_next_slot(key),
            })
        }
    }

    /// Delay until the oldest admitted request ages out of the window.
    /// Zero when a slot is free right now.
    pub fn time_to_next_slot(&self, key: &str) -> Duration {
        if self.max_requests == 0 {
            return self.window;
        }
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let Some(stamps) = windows.get_mut(key) else {
            return Duration::ZERO;
        };
        prune(stamps, now, self.window);
        if stamps.len() < self.max_requests {
            return Duration::ZERO;
        }
        match stamps.front() {
            Some(oldest) => self.window.saturating_sub(elapsed_since(now, *oldest)),
            None => Duration::ZERO,
        }
    }

    /// Admissions still available to `key` in the current window.
    pub fn remaining(&self, key: &str) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        match windows.get_mut(key) {
            Some(stamps) => {
                prune(stamps, now, self.window);
                self.max_requests.saturating_sub(stamps.len())
            }
            None => self.max_requests,
        }
    }

    /// Forget keys with no requests left in their window.
    pub fn cleanup(&self) {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        windows.retain(|_, stamps| {
            prune(stamps, now, self.window);
            !stamps.is_empty()
        });
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

/// Drop timestamps that are at least `window` old.
fn prune(stamps: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) {
    while let Some(oldest) = stamps.front() {
        if elapsed_since(now, *oldest) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}
