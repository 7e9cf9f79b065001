//! Resilience utilities: retry with backoff, per-tenant write throttling.
//!
//! - [`RetryConfig`]: Exponential backoff for transient gateway failures
//! - [`retry_with_backoff`]: Drive an async operation under a `RetryConfig`
//! - [`WriteThrottle`]: Token bucket spacing writes to one tenant
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use policy_replication::resilience::WriteThrottle;
//! use std::time::Duration;
//!
//! // At most one write per second to this tenant
//! let throttle = WriteThrottle::new(Duration::from_secs(1));
//! for _rule in 0..3 {
//!     throttle.acquire().await;
//!     // gateway.create_firewall_rule(rule).await;
//! }
//! # }
//! ```

use crate::error::Result;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retry used when opening a session to a tenant at the start of its sync.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay before next
    /// -------  -----------------
    /// 1        2s
    /// 2        4s
    /// 3        (give up, child skipped this cycle)
    /// ```
    pub fn tenant_connect(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));

        std::cmp::min(delay, self.max_delay)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// attempts in `config` are used up.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Write Throttling
// =============================================================================

/// Token bucket that spaces successive writes to one tenant.
///
/// The first write passes immediately; each following write waits until
/// `min_spacing` has elapsed since the previous permit.
pub struct WriteThrottle {
    limiter: Option<GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>>,
    min_spacing: Duration,
}

impl WriteThrottle {
    /// Create a throttle allowing one write per `min_spacing`.
    ///
    /// A zero spacing disables throttling.
    pub fn new(min_spacing: Duration) -> Self {
        let limiter = Quota::with_period(min_spacing).map(GovLimiter::direct);
        Self {
            limiter,
            min_spacing,
        }
    }

    /// Wait for a write permit.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    /// Take a permit if one is available now.
    pub fn try_acquire(&self) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }
}

impl std::fmt::Debug for WriteThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteThrottle")
            .field("min_spacing", &self.min_spacing)
            .finish()
    }
}
