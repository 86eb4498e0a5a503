//! Per-user sliding-window rate limiting.
//!
//! One reconciler owns the counters, so they live in process memory; a
//! periodic GC drops windows that have lapsed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    /// Window is full; carries how long until it resets.
    Rejected { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

#[derive(Debug)]
struct Window {
    started_at: Instant,
    count: u32,
}

/// Sliding-window counter keyed by user.
///
/// The window resets wholesale once its span elapses; within a window at
/// most `max` actions pass.
pub struct RateLimiter {
    window: Duration,
    max: u32,
    enabled: bool,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max: u32, enabled: bool) -> Self {
        Self {
            window,
            max,
            enabled,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one action for `user_id` and decide whether it may proceed.
    pub fn check(&self, user_id: &str) -> RateLimitDecision {
        self.check_at(user_id, Instant::now())
    }

    fn check_at(&self, user_id: &str, now: Instant) -> RateLimitDecision {
        if !self.enabled {
            return RateLimitDecision::Allowed;
        }

        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(user_id.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if now.duration_since(window.started_at) >= self.window {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= self.max {
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(window.started_at));
            return RateLimitDecision::Rejected { retry_after };
        }

        window.count += 1;
        RateLimitDecision::Allowed
    }

    /// Drop windows that lapsed; called on the reconcile tick.
    pub fn gc(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.retain(|_, window| now.duration_since(window.started_at) < self.window);
    }
}
