//! Retry utilities for batch sends
//!
//! A [`Retrier`] wraps one retryable unit of work (sending one batch) with
//! exponential backoff, jitter and rate-limit-aware delays:
//!
//! - `delay = base_delay × 2^(attempt − 1)`, scaled by a uniform jitter
//!   factor in `[0.5, 1.5]` and capped at `max_delay`
//! - HTTP 429 with `Retry-After` waits exactly the hinted duration
//! - HTTP 429 without a hint doubles the base delay before jitter and cap
//!
//! The jitter source is an owned [`StdRng`], seedable for reproducible tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use vaultflow_core::retry::{Retrier, RetryConfig};
//!
//! let retrier = Retrier::new(RetryConfig::default().with_max_retries(5));
//! let outcome = retrier.run(&cancel, || client.execute(&batch)).await;
//! ```

use crate::error::{Result, VaultError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lower bound of the jitter multiplier
pub const JITTER_MIN: f64 = 0.5;
/// Upper bound of the jitter multiplier
pub const JITTER_MAX: f64 = 1.5;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempt budget per batch, including the first attempt
    pub max_retries: u32,
    /// Base delay for the first backoff
    pub base_delay: Duration,
    /// Upper bound on computed (non `Retry-After`) delays
    pub max_delay: Duration,
    /// Apply the `[0.5, 1.5]` jitter multiplier
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single attempt, no backoff
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Number of attempts actually made; a zero budget still attempts once
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Un-jittered delay after `attempt` (1-indexed) failed
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let millis = self.base_delay.as_millis() as f64 * 2f64.powi(exponent as i32);
        Duration::from_millis(millis.min(u64::MAX as f64) as u64)
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Number of attempts made
    pub attempts: u32,
    /// Total time spent, including backoff
    pub total_duration: Duration,
    /// Number of 429 responses observed
    pub rate_limited: u32,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Succeeded, but only after at least one failed attempt
    pub fn retried_success(&self) -> bool {
        self.result.is_ok() && self.attempts > 1
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

/// Retry state machine around one unit of work
#[derive(Debug)]
pub struct Retrier {
    config: RetryConfig,
    rng: Mutex<StdRng>,
}

impl Retrier {
    /// Create a retrier with an entropy-seeded jitter source
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Create a retrier whose jitter sequence is reproducible
    pub fn with_seed(config: RetryConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay to wait after `attempt` (1-indexed) failed with `error`.
    pub fn backoff_delay(&self, attempt: u32, error: &VaultError) -> Duration {
        if let VaultError::RateLimited { retry_after, .. } = error {
            if let Some(hint) = retry_after {
                return *hint;
            }
        }

        let mut base = self.config.base_delay_for_attempt(attempt);
        if matches!(error, VaultError::RateLimited { .. }) {
            base = base.saturating_mul(2);
        }

        let factor = if self.config.jitter {
            self.rng.lock().gen_range(JITTER_MIN..=JITTER_MAX)
        } else {
            1.0
        };
        let millis = (base.as_millis() as f64 * factor).max(0.0);
        let capped = millis.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Run `operation` until it succeeds, fails permanently, exhausts the
    /// attempt budget, or `cancel` fires.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let budget = self.config.attempt_budget();
        let mut attempts = 0;
        let mut rate_limited = 0;

        loop {
            if cancel.is_cancelled() {
                return self.finish(Err(VaultError::Cancelled), attempts, start, rate_limited);
            }
            attempts += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(VaultError::Cancelled),
                r = operation() => r,
            };

            let error = match result {
                Ok(value) => return self.finish(Ok(value), attempts, start, rate_limited),
                Err(e) => e,
            };
            if matches!(error, VaultError::RateLimited { .. }) {
                rate_limited += 1;
            }

            if !error.is_retryable() {
                debug!("Attempt {} failed permanently: {}", attempts, error);
                return self.finish(Err(error), attempts, start, rate_limited);
            }
            if attempts >= budget {
                warn!("Giving up after {} attempts: {}", attempts, error);
                return self.finish(Err(error), attempts, start, rate_limited);
            }

            let delay = self.backoff_delay(attempts, &error);
            warn!(
                "Attempt {}/{} failed ({}), retrying in {:?}",
                attempts, budget, error, delay
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Cancelled during backoff after attempt {}", attempts);
                    return self.finish(Err(VaultError::Cancelled), attempts, start, rate_limited);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn finish<T>(
        &self,
        result: Result<T>,
        attempts: u32,
        start: Instant,
        rate_limited: u32,
    ) -> RetryOutcome<T> {
        RetryOutcome {
            result,
            attempts,
            total_duration: start.elapsed(),
            rate_limited,
        }
    }
}

/// Parse a `Retry-After` header expressed in whole seconds.
///
/// HTTP-date values are not supported and yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
