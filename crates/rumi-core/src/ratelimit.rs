// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-key sliding-window rate limiting on a monotonic clock.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window limiter: at most `max_requests` per `window` per key.
pub struct SlidingWindowLimiter {
    max_requests: u32,
    window: Duration,
    state: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    /// Create a limiter allowing `max_requests` within `window` per key.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt for `key`. Returns `false` when the window is full.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut state = self.state.lock().expect("rate limiter lock");
        let timestamps = state.entry(key.to_string()).or_default();

        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() as u32 >= self.max_requests {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    /// Configured per-key budget.
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }
}
