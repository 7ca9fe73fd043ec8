//! Sliding-window per-EA rate limiting.
//!
//! High-frequency market-data and lifecycle messages are exempt; everything
//! else is capped per sender id per window. Violations are dropped silently
//! (logged, never answered) so a misbehaving EA cannot use rejections as a
//! feedback channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Message types never counted against the limit.
pub const EXEMPT_TYPES: &[&str] = &[
    "hello",
    "deinit",
    "account_info",
    "trades_live",
    "trades_history",
    "trade_response",
    "trade_action",
    "trade_actions_bulk",
    "status",
    "tick",
];

pub fn is_exempt(msg_type: &str) -> bool {
    EXEMPT_TYPES.contains(&msg_type)
}

pub struct RateLimiter {
    window: Duration,
    max_per_window: usize,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_per_window: usize) -> Self {
        Self {
            window,
            max_per_window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record one message from `id` and report whether it is within limits.
    pub fn check(&self, id: &str) -> bool {
        self.check_at(id, Instant::now())
    }

    fn check_at(&self, id: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(id.to_string()).or_default();

        while let Some(&front) = bucket.front() {
            if now.duration_since(front) > self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() >= self.max_per_window {
            return false;
        }
        bucket.push_back(now);
        true
    }

    /// Drop the bucket for a disconnected EA.
    pub fn clear(&self, id: &str) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.remove(id);
    }
}
