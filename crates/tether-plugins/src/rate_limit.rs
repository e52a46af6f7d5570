//! Per-plugin request quotas.
//!
//! Each plugin name owns a sliding one-minute window of request timestamps.
//! Every capability built for a plugin shares the same limiter, so the quota
//! covers all of a plugin's backend calls together.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Length of the sliding quota window.
pub const QUOTA_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window request counter keyed by plugin name.
///
/// The read, prune, compare and append sequence for one name runs under that
/// name's map shard lock, so concurrent checks never lose an update.
#[derive(Debug)]
pub struct RateLimiter {
    requests_per_minute: u32,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter allowing `requests_per_minute` calls per plugin.
    #[must_use]
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            windows: DashMap::new(),
        }
    }

    /// The configured per-minute ceiling.
    #[must_use]
    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
    }

    /// Record a request for `plugin` if the quota allows it.
    ///
    /// Returns `false` without recording anything when the window is full.
    pub fn check_quota(&self, plugin: &str) -> bool {
        let now = Instant::now();
        let mut window = self.windows.entry(plugin.to_owned()).or_default();
        prune(&mut window, now);
        if window.len() >= self.ceiling() {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Requests `plugin` may still make in the current window.
    #[must_use]
    pub fn remaining_quota(&self, plugin: &str) -> u32 {
        let Some(mut window) = self.windows.get_mut(plugin) else {
            return self.requests_per_minute;
        };
        prune(&mut window, Instant::now());
        let used = u32::try_from(window.len()).unwrap_or(u32::MAX);
        self.requests_per_minute.saturating_sub(used)
    }

    /// How long until `plugin` gets a slot back, if its window is full.
    #[must_use]
    pub fn retry_after(&self, plugin: &str) -> Option<Duration> {
        let mut window = self.windows.get_mut(plugin)?;
        let now = Instant::now();
        prune(&mut window, now);
        if window.len() < self.ceiling() {
            return None;
        }
        let oldest = *window.front()?;
        Some(QUOTA_WINDOW.saturating_sub(now.saturating_duration_since(oldest)))
    }

    /// Forget every recorded request for `plugin`.
    pub fn reset_quota(&self, plugin: &str) {
        self.windows.remove(plugin);
    }

    fn ceiling(&self) -> usize {
        usize::try_from(self.requests_per_minute).unwrap_or(usize::MAX)
    }
}

/// Drop timestamps at least one window old.
fn prune(window: &mut VecDeque<Instant>, now: Instant) {
    while window
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) >= QUOTA_WINDOW)
    {
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_allows_up_to_ceiling() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.check_quota("p"));
        assert!(limiter.check_quota("p"));
        assert!(limiter.check_quota("p"));
        assert!(!limiter.check_quota("p"));
        assert_eq!(limiter.remaining_quota("p"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_does_not_consume_slot() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check_quota("p"));
        for _ in 0..10 {
            assert!(!limiter.check_quota("p"));
        }
        tokio::time::advance(QUOTA_WINDOW).await;
        assert!(limiter.check_quota("p"));
        assert!(!limiter.check_quota("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.check_quota("p"));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.check_quota("p"));
        assert!(!limiter.check_quota("p"));

        // The first request leaves the window; the second is still inside.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(limiter.remaining_quota("p"), 1);
        assert!(limiter.check_quota("p"));
        assert!(!limiter.check_quota("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plugins_are_independent() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check_quota("a"));
        assert!(limiter.check_quota("b"));
        assert!(!limiter.check_quota("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_for_unknown_plugin() {
        let limiter = RateLimiter::new(5);
        assert_eq!(limiter.remaining_quota("nobody"), 5);
        assert_eq!(limiter.retry_after("nobody"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_quota() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check_quota("p"));
        assert!(!limiter.check_quota("p"));
        limiter.reset_quota("p");
        assert_eq!(limiter.remaining_quota("p"), 1);
        assert!(limiter.check_quota("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check_quota("p"));
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(limiter.retry_after("p"), Some(Duration::from_secs(40)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_exceed_ceiling() {
        let limiter = Arc::new(RateLimiter::new(50));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                (0..20).filter(|_| limiter.check_quota("shared")).count()
            }));
        }
        let mut allowed = 0;
        for h in handles {
            allowed += h.await.unwrap();
        }
        assert_eq!(allowed, 50);
        assert_eq!(limiter.remaining_quota("shared"), 0);
    }
}
