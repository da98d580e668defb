//! Exponential backoff for broker operations.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::errors::{BrokerError, EventBusError};

/// Errors that distinguish connectivity blips from hard failures.
pub trait Transient {
    /// Whether retrying the failed operation may succeed.
    fn is_transient(&self) -> bool;
}

impl Transient for BrokerError {
    fn is_transient(&self) -> bool {
        BrokerError::is_transient(self)
    }
}

impl Transient for EventBusError {
    fn is_transient(&self) -> bool {
        EventBusError::is_transient(self)
    }
}

/// Wait-and-retry policy: one initial attempt, then up to `retry_count`
/// retries, sleeping `base_delay * 2^retry` before each retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retry_count: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// Default number of retries.
    pub const DEFAULT_RETRY_COUNT: u32 = 5;

    /// Default backoff unit (2, 4, 8, ... seconds).
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

    /// Longest single wait, regardless of attempt number.
    pub const MAX_DELAY: Duration = Duration::from_secs(300);

    #[must_use]
    pub fn new(retry_count: u32, base_delay: Duration) -> Self {
        Self {
            retry_count,
            base_delay,
        }
    }

    /// Policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(Self::MAX_DELAY)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// retry budget is spent. The last error is returned on exhaustion.
    pub async fn execute<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        E: Transient + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry_count => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        retries = self.retry_count,
                        timeout = %format!("{:.1}s", delay.as_secs_f64()),
                        error = %e,
                        "Broker operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RETRY_COUNT, Self::DEFAULT_BASE_DELAY)
    }
}
