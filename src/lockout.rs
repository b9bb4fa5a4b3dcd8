//! Per-user PIN lockout and per-IP sliding-window rate limiting.
//!
//! Both are hand-rolled in-memory maps rather than a crate like `governor`:
//! nothing in this corpus reaches for one, and the policy here (fixed
//! threshold, fixed window, reset on success) is simple enough that a crate
//! would add a dependency without buying much. State is explicitly allowed
//! to reset on process restart — see the spec's conservative-reset note.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    count: u32,
    last_attempt: Instant,
}

/// Tracks failed PIN attempts per user and decides account lockout.
pub struct PinLockout {
    threshold: u32,
    window: Duration,
    failures: Mutex<HashMap<String, FailureRecord>>,
}

impl PinLockout {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self { threshold, window, failures: Mutex::new(HashMap::new()) }
    }

    /// True if `user_id` is currently locked out (threshold reached within
    /// the window). Does not mutate state.
    pub async fn is_locked(&self, user_id: &str, now: Instant) -> bool {
        let failures = self.failures.lock().await;
        match failures.get(user_id) {
            Some(record) => record.count >= self.threshold && now.saturating_duration_since(record.last_attempt) < self.window,
            None => false,
        }
    }

    /// Record a failed attempt.
    pub async fn record_failure(&self, user_id: &str, now: Instant) {
        let mut failures = self.failures.lock().await;
        let record = failures.entry(user_id.to_string()).or_insert(FailureRecord { count: 0, last_attempt: now });

        if now.saturating_duration_since(record.last_attempt) >= self.window {
            record.count = 0;
        }
        record.count += 1;
        record.last_attempt = now;

        if record.count == self.threshold {
            warn!(user_id, count = record.count, "account locked out after repeated failed pin attempts");
        }
    }

    /// Clear the failure record on a successful unlock.
    pub async fn clear(&self, user_id: &str) {
        self.failures.lock().await.remove(user_id);
    }
}

/// Per-key sliding-window rate limiter. One instance per protected endpoint
/// class (unlock, export) since their limits differ.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window, hits: Mutex::new(HashMap::new()) }
    }

    /// Record a request from `key` and report whether it is within the
    /// limit. `key` is the caller's rate-limit key — first of
    /// `x-forwarded-for`, `x-real-ip`, or `"unknown"`, per the spec; this
    /// function is transport-agnostic and just takes the resolved string.
    pub async fn check(&self, key: &str, now: Instant) -> bool {
        let mut hits = self.hits.lock().await;
        let entry = hits.entry(key.to_string()).or_default();
        entry.retain(|t| now.saturating_duration_since(*t) < self.window);

        if entry.len() as u32 >= self.limit {
            return false;
        }
        entry.push(now);
        true
    }
}

/// Resolve the rate-limit key from the usual proxy headers, falling back to
/// `"unknown"`. Exposed as a free function so transports can call it without
/// a `RateLimiter` instance.
pub fn rate_limit_key(x_forwarded_for: Option<&str>, x_real_ip: Option<&str>) -> String {
    x_forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or(x_real_ip)
        .unwrap_or("unknown")
        .to_string()
}
