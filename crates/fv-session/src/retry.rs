//! Bounded exponential backoff for unlock attempts

use fv_core::config::UnlockConfig;
use fv_core::FvResult;
use std::future::Future;
use std::time::Duration;

/// How often, and how patiently, a retryable operation is attempted.
///
/// Attempt `n` (1-based) is preceded by a delay of
/// `base_delay * multiplier^(n-2)` capped at `max_delay`; the first attempt
/// runs immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UnlockConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &UnlockConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            multiplier: cfg.multiplier.max(1),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    /// A policy that tries exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            multiplier: 1,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based: 0 is the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Returns the last error on give-up.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> FvResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FvResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt - 1);
                    tracing::warn!(
                        what,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!(what, attempts = attempt, "giving up after retries");
                    }
                    return Err(e);
                }
            }
        }
    }
}
