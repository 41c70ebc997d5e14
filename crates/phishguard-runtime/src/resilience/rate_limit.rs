//! Fixed-window request limiter for provider calls.
//!
//! At most `limit` requests start per window. A caller arriving after the
//! window is exhausted sleeps until it resets instead of failing.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Default requests per minute when nothing is configured.
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 10;

struct Window {
    resets_at: Instant,
    used: u32,
}

/// Shared fixed-window limiter.
pub struct RequestRateLimiter {
    limit: u32,
    period: Duration,
    window: Mutex<Window>,
}

impl RequestRateLimiter {
    /// Limiter allowing `requests_per_minute` requests per minute.
    ///
    /// A limit of zero is treated as one.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(requests_per_minute, Duration::from_secs(60))
    }

    /// Limiter allowing `limit` requests per `period`.
    pub fn new(limit: u32, period: Duration) -> Self {
        Self {
            limit: limit.max(1),
            period,
            window: Mutex::new(Window {
                resets_at: Instant::now() + period,
                used: 0,
            }),
        }
    }

    /// Wait until a request may start, then count it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock();
                let now = Instant::now();
                if now >= window.resets_at {
                    window.resets_at = now + self.period;
                    window.used = 0;
                }
                if window.used < self.limit {
                    window.used += 1;
                    return;
                }
                window.resets_at - now
            };

            tracing::info!(
                limit = self.limit,
                wait_ms = wait.as_millis() as u64,
                "Provider rate limit reached, waiting for window reset"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Requests still available in the current window.
    pub fn remaining(&self) -> u32 {
        let window = self.window.lock();
        if Instant::now() >= window.resets_at {
            self.limit
        } else {
            self.limit.saturating_sub(window.used)
        }
    }

    /// Configured requests per window.
    pub fn limit(&self) -> u32 {
        self.limit
    }
}

impl Default for RequestRateLimiter {
    fn default() -> Self {
        Self::per_minute(DEFAULT_REQUESTS_PER_MINUTE)
    }
}

impl std::fmt::Debug for RequestRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRateLimiter")
            .field("limit", &self.limit)
            .field("period", &self.period)
            .field("remaining", &self.remaining())
            .finish()
    }
}
