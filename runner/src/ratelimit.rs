//! Sliding-window rate limits and the global concurrent-build counter.

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::store::CounterStore;

/// Recorded timestamps older than this are dropped on write.
const RETENTION_SECS: i64 = 3600;
/// Series files untouched for this long are removed by [`RateLimiter::cleanup`].
const CLEANUP_AGE: Duration = Duration::from_secs(2 * 3600);
const CONCURRENT_COUNTER: &str = "concurrent";

pub const ACTION_BUILD_MINUTE: &str = "build_minute";
pub const ACTION_BUILD_HOUR: &str = "build_hour";

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    limits: RateLimitConfig,
}

fn series_key(identifier: &str, action: &str) -> String {
    let digest = Sha256::digest(format!("{identifier}:{action}").as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut hex, b| {
        let _ = write!(hex, "{b:02x}");
        hex
    })
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limits: RateLimitConfig) -> Self {
        Self { store, limits }
    }

    fn count_in_window(&self, identifier: &str, action: &str, window: Duration, now: i64) -> usize {
        let start = now.saturating_sub(i64::try_from(window.as_secs()).unwrap_or(i64::MAX));
        self.store
            .read_series(&series_key(identifier, action))
            .into_iter()
            .filter(|ts| (start..=now).contains(ts))
            .count()
    }

    /// Fewer than `limit` events in `[now - window, now]`.
    pub fn is_allowed(&self, identifier: &str, action: &str, limit: usize, window: Duration) -> bool {
        self.is_allowed_at(identifier, action, limit, window, unix_now())
    }

    pub fn is_allowed_at(
        &self,
        identifier: &str,
        action: &str,
        limit: usize,
        window: Duration,
        now: i64,
    ) -> bool {
        self.count_in_window(identifier, action, window, now) < limit
    }

    pub fn record(&self, identifier: &str, action: &str) {
        self.record_at(identifier, action, unix_now());
    }

    pub fn record_at(&self, identifier: &str, action: &str, now: i64) {
        let cutoff = now.saturating_sub(RETENTION_SECS);
        self.store
            .update_series(&series_key(identifier, action), &mut |series| {
                series.push(now);
                series.retain(|ts| *ts > cutoff);
            });
    }

    pub fn remaining(&self, identifier: &str, action: &str, limit: usize, window: Duration) -> usize {
        self.remaining_at(identifier, action, limit, window, unix_now())
    }

    pub fn remaining_at(
        &self,
        identifier: &str,
        action: &str,
        limit: usize,
        window: Duration,
        now: i64,
    ) -> usize {
        limit.saturating_sub(self.count_in_window(identifier, action, window, now))
    }

    pub fn concurrent_builds(&self) -> u64 {
        self.store.read_counter(CONCURRENT_COUNTER)
    }

    pub fn increment_concurrent(&self) {
        let n = self.store.add_to_counter(CONCURRENT_COUNTER, 1);
        debug!(concurrent = n, "build slot taken");
    }

    pub fn decrement_concurrent(&self) {
        let n = self.store.add_to_counter(CONCURRENT_COUNTER, -1);
        debug!(concurrent = n, "build slot released");
    }

    /// Count one build in progress until the returned slot is dropped.
    pub fn acquire_slot(&self) -> ConcurrencySlot {
        self.increment_concurrent();
        ConcurrencySlot {
            limiter: self.clone(),
        }
    }

    /// Every limit the next build by `ip` would break, in check order.
    pub fn check_build_limits(&self, ip: &str, _session_id: &str) -> Vec<String> {
        self.check_build_limits_at(ip, unix_now())
    }

    pub fn check_build_limits_at(&self, ip: &str, now: i64) -> Vec<String> {
        let mut errors = Vec::new();
        let per_minute = self.limits.builds_per_ip_per_minute;
        if !self.is_allowed_at(ip, ACTION_BUILD_MINUTE, per_minute, Duration::from_secs(60), now) {
            errors.push(format!(
                "Rate limit exceeded: max {per_minute} builds per minute"
            ));
        }
        let per_hour = self.limits.builds_per_ip_per_hour;
        if !self.is_allowed_at(ip, ACTION_BUILD_HOUR, per_hour, Duration::from_secs(3600), now) {
            errors.push(format!("Rate limit exceeded: max {per_hour} builds per hour"));
        }
        let max_concurrent = self.limits.max_concurrent_builds;
        if self.concurrent_builds() >= max_concurrent {
            errors.push(format!(
                "Server busy: max {max_concurrent} concurrent builds"
            ));
        }
        errors
    }

    /// Record a build against both per-IP windows.
    pub fn record_build(&self, ip: &str) {
        self.record(ip, ACTION_BUILD_MINUTE);
        self.record(ip, ACTION_BUILD_HOUR);
    }

    pub fn cleanup(&self) -> usize {
        self.store.cleanup(CLEANUP_AGE)
    }
}

/// One in-flight build. Dropping it decrements the counter, including during
/// unwinding.
pub struct ConcurrencySlot {
    limiter: RateLimiter,
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        self.limiter.decrement_concurrent();
    }
}
