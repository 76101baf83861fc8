//! Retry backoff and destination write throttling.
//!
//! - [`RetryConfig`]: exponential backoff presets for connecting, reading the
//!   change stream and persisting checkpoints or writes
//! - [`RateLimiter`]: process-wide ceiling on destination writes per second
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use changefeed_migrator::resilience::RateLimiter;
//!
//! // Destination provisioned for 400 writes/sec
//! let limiter = RateLimiter::per_second(400);
//! limiter.acquire().await; // Waits while over the limit
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Bounded exponential backoff.
///
/// Attempt `n` (1-based) waits `initial_delay * backoff_factor^(n-1)`, capped
/// at `max_delay`, before attempt `n + 1`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first. Never less than 1.
    pub max_attempts: usize,

    pub initial_delay: Duration,

    /// Ceiling for a single backoff.
    pub max_delay: Duration,

    pub backoff_factor: f64,

    /// Deadline for one connection attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::reads(5)
    }
}

impl RetryConfig {
    /// Connecting to the account at process start.
    ///
    /// Gives up after about 45 seconds so a wrong endpoint is reported
    /// instead of hanging.
    ///
    /// ```text
    /// Attempt  Delay     Cumulative
    /// -------  -----     ----------
    /// 1        500ms     500ms
    /// 2        750ms     1.25s
    /// 3        1.12s     2.37s
    /// ...
    /// 20       30s       ~45s (total)
    /// ```
    pub fn startup() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Change stream reads: a few quick retries before the worker fails the
    /// partition and the coordinator's own backoff takes over.
    pub fn reads(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }

    /// Destination upserts and lease checkpoints.
    pub fn writes(max_attempts: usize, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Millisecond backoffs for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Delay after failed attempt `attempt` (1-based; 0 is treated as 1).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

// =============================================================================
// Destination throttling
// =============================================================================

/// Token bucket over destination writes.
///
/// One limiter is shared by every replay worker, so the configured throughput
/// caps the whole process. Up to one second of unused budget can be spent as
/// a burst.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    writes_per_sec: NonZeroU32,
}

impl RateLimiter {
    /// Allow `writes_per_sec` writes per second (0 is treated as 1).
    pub fn per_second(writes_per_sec: u32) -> Self {
        let rate = NonZeroU32::new(writes_per_sec).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: GovLimiter::direct(Quota::per_second(rate)),
            writes_per_sec: rate,
        }
    }

    /// Wait for a write permit. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn writes_per_sec(&self) -> u32 {
        self.writes_per_sec.get()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("writes_per_sec", &self.writes_per_sec)
            .finish()
    }
}
