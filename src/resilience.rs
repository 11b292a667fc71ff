//! Resilience utilities: retry backoff, rate limiting, bulkheads.
//!
//! - [`RetryConfig`]: exponential backoff for transient failures
//! - [`RateLimiter`]: token bucket to keep reconnect bursts off the targets
//! - [`Bulkhead`]: semaphore capping concurrent target writes
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), mirror_engine::resilience::BulkheadFull> {
//! use mirror_engine::resilience::{Bulkhead, RateLimiter, RateLimitConfig};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Blocks if over limit
//!
//! let bulkhead = Bulkhead::new(8);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::RetrySettings;

/// Configuration for connection retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts. `usize::MAX` means retry forever
    /// (source session mode).
    pub max_attempts: usize,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (2.0 = double each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual connection attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Build target-session retry settings from the service config.
    pub fn from_settings(settings: &RetrySettings, connection_timeout: Duration) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_secs(settings.initial_delay_secs),
            max_delay: Duration::from_secs(settings.max_delay_secs),
            backoff_factor: settings.backoff_factor,
            connection_timeout,
        }
    }

    /// Bounded retry for the initial source connection. Exhausting this at
    /// startup is exit code 3.
    pub fn startup() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Infinite retry for the running source session.
    ///
    /// Long-haul links drop; the engine must outlast a multi-hour incident
    /// without a restart, so the cap is 5 minutes and we never give up.
    pub fn source() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay = Duration::from_secs_f64(self.initial_delay.as_secs_f64() * multiplier);

        std::cmp::min(delay, self.max_delay)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token-bucket parameters: tokens refill at `refill_rate` per second, up
/// to `burst_size` tokens; each event consumes one.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 events/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

impl RateLimitConfig {
    /// Derive from the incremental config's optional per-second cap.
    pub fn per_second(rate: u32) -> Self {
        Self {
            burst_size: rate.max(1) / 10 + 1,
            refill_rate: rate.max(1),
        }
    }
}

/// Token bucket rate limiter. Thread-safe and async-aware.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota =
            Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
                .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Acquire a permit, blocking until one is available. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    pub max_concurrent: usize,
}

/// Limits concurrent operations to prevent resource exhaustion.
///
/// Used to cap the per-event worker pool that applies one change to many
/// targets in parallel.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Try to acquire a permit without waiting.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
