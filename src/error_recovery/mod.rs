//! Error recovery for MCP operations
//!
//! This module provides the two fault-tolerance layers every operation runs
//! through:
//!
//! - [`RetryPolicy`]: bounded local retries with exponential backoff for
//!   retryable failures
//! - [`CircuitBreaker`]: per-configuration failure counting that short-circuits
//!   calls to a failing server until a cooldown elapses
//!
//! [`CircuitBreakerRegistry`] owns one breaker per configuration key and is
//! safe to share between concurrent requests. Admission hands out a
//! [`CircuitPermit`]; an unsettled permit that holds the half-open trial gives
//! the trial slot back when dropped.

pub mod retry;

pub use retry::{BoxFuture, RetryPolicy};

use crate::config::CircuitBreakerSettings;
use crate::error::{McpError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Wait hint handed out while a half-open trial is still in flight
const TRIAL_IN_FLIGHT_HINT: Duration = Duration::from_secs(1);

/// Circuit breaker for preventing cascading failures
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before letting a trial request through
    pub cooldown: Duration,
    state: CircuitBreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreaker {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self::new(settings.failure_threshold, settings.cooldown)
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: CircuitBreakerState::Closed,
            failure_count: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    /// Check if a request should be allowed through
    ///
    /// Once the cooldown has elapsed the circuit turns half-open and exactly
    /// one trial is admitted; everything else keeps failing fast until that
    /// trial's outcome is recorded.
    pub fn should_allow_request(&mut self) -> bool {
        match self.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => {
                let cooled_down = self
                    .opened_at
                    .map_or(true, |opened_at| opened_at.elapsed() >= self.cooldown);
                if cooled_down {
                    debug!("Circuit breaker entering half-open state");
                    self.state = CircuitBreakerState::HalfOpen;
                    self.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitBreakerState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitBreakerState::Closed => {
                self.failure_count = 0;
            }
            CircuitBreakerState::HalfOpen | CircuitBreakerState::Open => {
                debug!("Circuit breaker closing after successful trial");
                self.state = CircuitBreakerState::Closed;
                self.failure_count = 0;
                self.opened_at = None;
                self.trial_in_flight = false;
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);

        match self.state {
            CircuitBreakerState::Closed => {
                if self.failure_count >= self.failure_threshold {
                    debug!(
                        "Circuit breaker opening due to {} failures",
                        self.failure_count
                    );
                    self.open();
                }
            }
            CircuitBreakerState::HalfOpen => {
                debug!("Circuit breaker opening again after failed trial");
                self.open();
            }
            CircuitBreakerState::Open => {}
        }
    }

    /// Hand back the half-open trial slot without recording an outcome
    pub fn release_trial(&mut self) {
        if self.state == CircuitBreakerState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    fn open(&mut self) {
        self.state = CircuitBreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.trial_in_flight = false;
    }

    /// Time until a trial will be admitted; zero when calls may proceed
    pub fn retry_after(&self) -> Duration {
        match self.state {
            CircuitBreakerState::Closed => Duration::ZERO,
            CircuitBreakerState::Open => self
                .opened_at
                .map(|opened_at| self.cooldown.saturating_sub(opened_at.elapsed()))
                .unwrap_or(Duration::ZERO),
            CircuitBreakerState::HalfOpen if self.trial_in_flight => TRIAL_IN_FLIGHT_HINT,
            CircuitBreakerState::HalfOpen => Duration::ZERO,
        }
    }

    pub fn state(&self) -> &str {
        match self.state {
            CircuitBreakerState::Closed => "closed",
            CircuitBreakerState::Open => "open",
            CircuitBreakerState::HalfOpen => "half-open",
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

/// Point-in-time view of one breaker, for status reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub state: String,
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

type BreakerMap = Arc<Mutex<HashMap<String, CircuitBreaker>>>;

fn lock_breakers(breakers: &Mutex<HashMap<String, CircuitBreaker>>) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
    breakers.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record_success_in(breakers: &Mutex<HashMap<String, CircuitBreaker>>, key: &str) {
    let mut breakers = lock_breakers(breakers);
    if let Some(breaker) = breakers.get_mut(key) {
        let was_closed = breaker.state() == "closed";
        breaker.record_success();
        if !was_closed {
            info!(key, "Circuit closed");
        }
    }
}

fn record_failure_in(breakers: &Mutex<HashMap<String, CircuitBreaker>>, settings: &CircuitBreakerSettings, key: &str) {
    let mut breakers = lock_breakers(breakers);
    let breaker = breakers
        .entry(key.to_string())
        .or_insert_with(|| CircuitBreaker::from(settings));
    let was_open = breaker.state() == "open";
    breaker.record_failure();
    if !was_open && breaker.state() == "open" {
        warn!(
            key,
            failure_count = breaker.failure_count(),
            cooldown_secs = breaker.cooldown.as_secs(),
            "Circuit opened"
        );
    }
}

/// Admission of one operation through a breaker
///
/// Settle it with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping it unsettled counts as
/// neither; if it held the half-open trial, the next caller becomes the trial.
#[must_use = "dropping a permit records no outcome"]
#[derive(Debug)]
pub struct CircuitPermit {
    breakers: BreakerMap,
    settings: CircuitBreakerSettings,
    key: String,
    trial: bool,
    settled: bool,
}

impl CircuitPermit {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this permit is the single half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        record_success_in(&self.breakers, &self.key);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        record_failure_in(&self.breakers, &self.settings, &self.key);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.settled || !self.trial {
            return;
        }
        if let Some(breaker) = lock_breakers(&self.breakers).get_mut(&self.key) {
            breaker.release_trial();
            debug!(key = %self.key, "Half-open trial ended without an outcome, slot released");
        }
    }
}

/// Per-key circuit breakers behind a single lock
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    settings: CircuitBreakerSettings,
    breakers: BreakerMap,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Gate an operation for `key`, failing fast while the circuit is open
    pub fn check(&self, key: &str) -> Result<CircuitPermit> {
        let mut breakers = lock_breakers(&self.breakers);
        let breaker = breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::from(&self.settings));

        if breaker.should_allow_request() {
            return Ok(CircuitPermit {
                breakers: self.breakers.clone(),
                settings: self.settings.clone(),
                key: key.to_string(),
                trial: breaker.state() == "half-open",
                settled: false,
            });
        }

        let retry_after = breaker.retry_after();
        debug!(
            key,
            failure_count = breaker.failure_count(),
            retry_after_ms = retry_after.as_millis() as u64,
            "Circuit open, rejecting call"
        );
        Err(McpError::circuit_open(
            key,
            retry_after,
            breaker.failure_count(),
        ))
    }

    pub fn record_success(&self, key: &str) {
        record_success_in(&self.breakers, key);
    }

    pub fn record_failure(&self, key: &str) {
        record_failure_in(&self.breakers, &self.settings, key);
    }

    pub fn snapshot(&self, key: &str) -> Option<CircuitSnapshot> {
        lock_breakers(&self.breakers).get(key).map(|breaker| {
            let retry_after = breaker.retry_after();
            CircuitSnapshot {
                state: breaker.state().to_string(),
                failure_count: breaker.failure_count(),
                retry_after_secs: (!retry_after.is_zero()).then(|| retry_after.as_secs()),
            }
        })
    }

    /// Drop breakers that are closed with no recorded failures
    pub fn prune(&self) {
        lock_breakers(&self.breakers)
            .retain(|_, breaker| breaker.state() != "closed" || breaker.failure_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[test]
    fn test_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        for _ in 0..2 {
            assert!(breaker.should_allow_request());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), "closed");

        breaker.record_failure();
        assert_eq!(breaker.state(), "open");
        assert_eq!(breaker.failure_count(), 3);
        assert!(!breaker.should_allow_request());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), "closed");
        assert_eq!(breaker.failure_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.record_failure();
        assert!(!breaker.should_allow_request());
        assert_eq!(breaker.retry_after(), Duration::from_secs(10));

        advance(Duration::from_secs(4)).await;
        assert_eq!(breaker.retry_after(), Duration::from_secs(6));

        advance(Duration::from_secs(6)).await;
        assert!(breaker.should_allow_request());
        assert_eq!(breaker.state(), "half-open");
        assert!(!breaker.should_allow_request());

        breaker.record_success();
        assert_eq!(breaker.state(), "closed");
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.should_allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(5));
        breaker.record_failure();
        breaker.record_failure();

        advance(Duration::from_secs(5)).await;
        assert!(breaker.should_allow_request());
        breaker.record_failure();

        assert_eq!(breaker.state(), "open");
        assert!(!breaker.should_allow_request());
        assert_eq!(breaker.retry_after(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_fails_fast_with_details() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerSettings {
            failure_threshold: 2,
            cooldown: Duration::from_secs(30),
        });

        registry.check("owner/a").unwrap().record_failure();
        registry.record_failure("owner/a");

        match registry.check("owner/a") {
            Err(McpError::CircuitOpen {
                key,
                retry_after,
                failure_count,
            }) => {
                assert_eq!(key, "owner/a");
                assert_eq!(retry_after, Duration::from_secs(30));
                assert_eq!(failure_count, 2);
            }
            other => panic!("expected circuit open, got {:?}", other),
        }

        // Other keys are unaffected
        assert!(!registry.check("owner/b").unwrap().is_trial());

        advance(Duration::from_secs(30)).await;
        let trial = registry.check("owner/a").unwrap();
        assert!(trial.is_trial());
        trial.record_success();

        let snapshot = registry.snapshot("owner/a").unwrap();
        assert_eq!(snapshot.state, "closed");
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.retry_after_secs, None);
    }

    #[test]
    fn test_prune_keeps_failing_keys() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerSettings::default());
        registry.check("healthy").unwrap().record_success();
        registry.record_failure("flaky");

        registry.prune();
        assert!(registry.snapshot("healthy").is_none());
        assert_eq!(registry.snapshot("flaky").unwrap().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_trial_gives_back_its_slot() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerSettings {
            failure_threshold: 1,
            cooldown: Duration::from_secs(10),
        });
        registry.record_failure("owner/a");
        advance(Duration::from_secs(10)).await;

        let trial = registry.check("owner/a").unwrap();
        assert!(trial.is_trial());
        assert!(registry.check("owner/a").is_err());

        drop(trial);
        assert_eq!(registry.snapshot("owner/a").unwrap().state, "half-open");
        assert_eq!(registry.snapshot("owner/a").unwrap().retry_after_secs, None);

        let trial = registry.check("owner/a").unwrap();
        assert!(trial.is_trial());
        trial.record_success();
        assert_eq!(registry.snapshot("owner/a").unwrap().state, "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_failure_keeps_circuit_open() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerSettings {
            failure_threshold: 1,
            cooldown: Duration::from_secs(10),
        });
        registry.record_failure("owner/a");
        advance(Duration::from_secs(10)).await;

        registry.check("owner/a").unwrap().record_failure();
        assert_eq!(registry.snapshot("owner/a").unwrap().state, "open");
        assert!(registry.check("owner/a").is_err());
    }
}
