//! Dual sliding-window admission control.
//!
//! Tracks request timestamps and token usage over the trailing 60 seconds.
//! A caller about to hit the backend calls [`RateLimiter::check_and_wait`]
//! with its estimated cost and is held back until both windows have room;
//! after the call completes (success or failure) it reports the actual cost
//! with [`RateLimiter::record_request`].

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

const WINDOW: Duration = Duration::from_secs(60);

/// Point-in-time view of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimiterUsage {
    pub requests_in_window: usize,
    pub tokens_in_window: u64,
    pub rpm_limit: u32,
    pub tpm_limit: u32,
}

#[derive(Debug, Default)]
struct Window {
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u32)>,
}

impl Window {
    fn purge(&mut self, now: Instant) {
        while self
            .requests
            .front()
            .is_some_and(|&t| now.duration_since(t) >= WINDOW)
        {
            self.requests.pop_front();
        }
        while self
            .tokens
            .front()
            .is_some_and(|&(t, _)| now.duration_since(t) >= WINDOW)
        {
            self.tokens.pop_front();
        }
    }

    fn tokens_in_window(&self) -> u64 {
        self.tokens.iter().map(|&(_, n)| u64::from(n)).sum()
    }

    /// Time until an entry recorded at `oldest` leaves the window.
    fn remaining(oldest: Instant, now: Instant) -> Duration {
        WINDOW.saturating_sub(now.duration_since(oldest))
    }
}

/// Requests-per-minute and tokens-per-minute limiter. A limit of 0 disables
/// that dimension.
///
/// The window lives behind an async mutex that stays held while a caller
/// sleeps, so concurrent callers queue up behind the one being throttled and
/// every caller sees a consistent window.
#[derive(Debug)]
pub struct RateLimiter {
    rpm_limit: u32,
    tpm_limit: u32,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(rpm_limit: u32, tpm_limit: u32) -> Self {
        Self {
            rpm_limit,
            tpm_limit,
            window: Mutex::new(Window::default()),
        }
    }

    /// Block until a request costing `estimated_tokens` fits in both windows.
    ///
    /// Never fails; the worst case is a wait of just under 60 seconds per
    /// dimension.
    pub async fn check_and_wait(&self, estimated_tokens: u32) {
        let mut window = self.window.lock().await;
        let mut now = Instant::now();
        window.purge(now);

        if self.rpm_limit > 0 && window.requests.len() >= self.rpm_limit as usize {
            if let Some(&oldest) = window.requests.front() {
                let wait = Window::remaining(oldest, now);
                if !wait.is_zero() {
                    warn!(
                        wait_secs = wait.as_secs_f64(),
                        rpm_limit = self.rpm_limit,
                        "RPM limit reached, waiting"
                    );
                    tokio::time::sleep(wait).await;
                    now = Instant::now();
                    window.purge(now);
                }
            }
        }

        if self.tpm_limit > 0 && !window.tokens.is_empty() {
            let current = window.tokens_in_window();
            if current + u64::from(estimated_tokens) > u64::from(self.tpm_limit) {
                if let Some(&(oldest, _)) = window.tokens.front() {
                    let wait = Window::remaining(oldest, now);
                    if !wait.is_zero() {
                        warn!(
                            wait_secs = wait.as_secs_f64(),
                            tokens_in_window = current,
                            tpm_limit = self.tpm_limit,
                            "TPM limit reached, waiting"
                        );
                        tokio::time::sleep(wait).await;
                        window.purge(Instant::now());
                    }
                }
            }
        }
    }

    /// Account for a completed call. Token usage is tracked only when
    /// `tokens_used > 0`.
    pub async fn record_request(&self, tokens_used: u32) {
        let mut window = self.window.lock().await;
        let now = Instant::now();
        window.requests.push_back(now);
        if tokens_used > 0 {
            window.tokens.push_back((now, tokens_used));
        }
    }

    pub async fn get_current_usage(&self) -> RateLimiterUsage {
        let mut window = self.window.lock().await;
        window.purge(Instant::now());
        RateLimiterUsage {
            requests_in_window: window.requests.len(),
            tokens_in_window: window.tokens_in_window(),
            rpm_limit: self.rpm_limit,
            tpm_limit: self.tpm_limit,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(60, 90_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rpm_blocks_until_oldest_request_ages_out() {
        let limiter = RateLimiter::new(3, 0);
        let start = Instant::now();

        for _ in 0..3 {
            limiter.check_and_wait(0).await;
            limiter.record_request(0).await;
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        assert_eq!(start.elapsed(), Duration::from_secs(15));

        // Fourth call must wait until the first request is 60s old.
        limiter.check_and_wait(0).await;
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(limiter.get_current_usage().await.requests_in_window, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn under_limit_does_not_wait() {
        let limiter = RateLimiter::new(10, 1_000);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.check_and_wait(100).await;
            limiter.record_request(100).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limits_disable_admission_control() {
        let limiter = RateLimiter::new(0, 0);
        let start = Instant::now();
        for _ in 0..500 {
            limiter.check_and_wait(10_000).await;
            limiter.record_request(10_000).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn tpm_waits_for_token_headroom() {
        let limiter = RateLimiter::new(0, 1_000);
        let start = Instant::now();

        limiter.record_request(800).await;
        tokio::time::advance(Duration::from_secs(20)).await;

        limiter.check_and_wait(300).await;
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(limiter.get_current_usage().await.tokens_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tpm_not_enforced_on_empty_window() {
        // Even an estimate above the limit passes when nothing is recorded.
        let limiter = RateLimiter::new(0, 1_000);
        let start = Instant::now();
        limiter.check_and_wait(5_000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn usage_snapshot_purges_old_entries() {
        let limiter = RateLimiter::new(60, 90_000);
        limiter.record_request(120).await;
        limiter.record_request(0).await;

        let usage = limiter.get_current_usage().await;
        assert_eq!(usage.requests_in_window, 2);
        assert_eq!(usage.tokens_in_window, 120);
        assert_eq!(usage.rpm_limit, 60);
        assert_eq!(usage.tpm_limit, 90_000);

        tokio::time::advance(Duration::from_secs(61)).await;
        let usage = limiter.get_current_usage().await;
        assert_eq!(usage.requests_in_window, 0);
        assert_eq!(usage.tokens_in_window, 0);
    }

    #[test]
    fn usage_serializes_for_status() {
        let usage = RateLimiterUsage {
            requests_in_window: 1,
            tokens_in_window: 42,
            rpm_limit: 60,
            tpm_limit: 90_000,
        };
        let json = serde_json::to_value(usage).unwrap();
        assert_eq!(json["tokens_in_window"], 42);
    }
}
