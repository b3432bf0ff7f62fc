//! Bounded retries with exponential backoff
//!
//! Retryable failures ([`McpError::is_retryable`]) are attempted again up to
//! `max_retries` times. The wait before retry *n* is
//! `min(initial_backoff * 2^(n-1), max_backoff)`, raised to the server's
//! `Retry-After` hint when one was given. Fatal failures return at once.

use crate::config::RetrySettings;
use crate::error::{McpError, Result};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Type alias for boxed future to simplify retry function signatures
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Spread delays by +/-25% to avoid synchronized retries
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: settings.initial_backoff,
            max_backoff: settings.max_backoff,
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    /// Disable retries (for testing or when retries are undesired)
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (1-based), without jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    fn wait_before(&self, retry: u32, error: &McpError) -> Duration {
        let mut delay = self.delay_for(retry);
        if let Some(hint) = error.retry_after() {
            delay = delay.max(hint).min(self.max_backoff);
        }
        if self.jitter {
            let factor = 0.75 + fastrand::f64() * 0.5;
            delay = delay.mul_f64(factor);
        }
        delay
    }

    /// Run `operation` against `state`, retrying retryable failures
    ///
    /// The state (usually a connection) is handed to each attempt by mutable
    /// reference so an attempt can reconnect before sending.
    pub async fn execute<S, T, F>(&self, operation: &str, state: &mut S, mut attempt_fn: F) -> Result<T>
    where
        S: ?Sized + Send,
        F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match attempt_fn(&mut *state).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if error.is_retryable() && attempt <= self.max_retries => {
                    let delay = self.wait_before(attempt, &error);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after retryable failure"
                    );
                    sleep(delay).await;
                }
                Err(error) => {
                    if error.is_retryable() {
                        warn!(operation, attempts = attempt, error = %error, "Retries exhausted");
                    } else {
                        debug!(operation, attempt, error = %error, "Failing without retry");
                    }
                    return Err(error);
                }
            }
        }
    }
}
