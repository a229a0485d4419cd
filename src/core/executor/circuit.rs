//! Circuit breaker over a rolling outcome window.
//!
//! A fixed-capacity ring of 0/1 outcomes decides when the venue is too
//! unhealthy to call: `closed → open` when more than half of at least ten
//! samples are errors, `open → half_open` after a cooldown, and a single
//! half-open probe decides reopen-or-close.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{error, info};

use crate::core::metrics;
use crate::error::{Error, Result};

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Ring capacity for call outcomes.
    pub window_capacity: usize,
    /// Minimum samples before the error rate is trusted.
    pub min_samples: usize,
    /// Open when `errors / samples` exceeds this.
    pub error_rate_threshold: f64,
    /// How long the circuit stays open before a half-open probe.
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_capacity: 100,
            min_samples: 10,
            error_rate_threshold: 0.5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Window {
    outcomes: VecDeque<bool>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, is_error: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(is_error);
    }

    fn samples(&self) -> usize {
        self.outcomes.len()
    }

    fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let errors = self.outcomes.iter().filter(|e| **e).count();
        errors as f64 / self.outcomes.len() as f64
    }
}

struct Inner {
    window: Window,
    state: CircuitState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
}

/// Fail-fast switch guarding all venue calls of one executor.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                window: Window::new(config.window_capacity),
                state: CircuitState::Closed,
                opened_at: None,
                consecutive_failures: 0,
            }),
            config,
        }
    }

    /// Gate a call. Handles the open→half-open timeout transition.
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(Duration::MAX, |at| at.elapsed());
                if elapsed >= self.config.open_timeout {
                    info!("Circuit breaker half-open after timeout");
                    inner.state = CircuitState::HalfOpen;
                    Self::publish(&inner);
                    Ok(())
                } else {
                    Err(Error::CircuitOpen)
                }
            }
        }
    }

    /// Record a successful call outcome.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        match inner.state {
            CircuitState::HalfOpen => {
                info!("Circuit breaker closed after successful probe");
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                // Fresh window: the error history that opened the circuit is
                // stale once the venue proves healthy again.
                inner.window = Window::new(self.config.window_capacity);
                inner.window.push(false);
            }
            _ => inner.window.push(false),
        }
        Self::publish(&inner);
    }

    /// Record a failed call outcome.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.window.push(true);

        match inner.state {
            CircuitState::HalfOpen => {
                error!("Circuit breaker reopened: half-open probe failed");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                if inner.window.samples() >= self.config.min_samples
                    && inner.window.error_rate() > self.config.error_rate_threshold
                {
                    error!(
                        error_rate = inner.window.error_rate(),
                        samples = inner.window.samples(),
                        "Circuit breaker opened: error rate over threshold"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
        Self::publish(&inner);
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Error rate over the rolling window, in `[0, 1]`.
    pub fn error_rate(&self) -> f64 {
        self.inner.lock().window.error_rate()
    }

    /// Consecutive failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    fn publish(inner: &Inner) {
        let state_value = match inner.state {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        metrics::EXECUTOR.circuit_state.set(state_value);
        metrics::EXECUTOR
            .error_rate
            .set(inner.window.error_rate() * 100.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::default())
    }

    #[tokio::test]
    async fn stays_closed_below_min_samples() {
        let cb = breaker();
        for _ in 0..9 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check().is_ok());
    }

    #[tokio::test]
    async fn opens_at_min_samples_over_threshold() {
        let cb = breaker();
        for _ in 0..10 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.check(), Err(Error::CircuitOpen)));
    }

    #[tokio::test]
    async fn mixed_outcomes_below_threshold_stay_closed() {
        let cb = breaker();
        // 5 errors / 10 samples = exactly 0.5, not over the threshold.
        for _ in 0..5 {
            cb.record_failure();
            cb.record_success();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_timeout_then_closes_on_success() {
        let cb = breaker();
        for _ in 0..10 {
            cb.record_failure();
        }
        assert!(matches!(cb.check(), Err(Error::CircuitOpen)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.error_rate() < 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_failure_reopens_and_resets_timer() {
        let cb = breaker();
        for _ in 0..10 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cb.check().is_ok());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Timer restarted: still open before another full timeout.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(cb.check(), Err(Error::CircuitOpen)));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.check().is_ok());
    }

    #[tokio::test]
    async fn window_is_bounded() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            window_capacity: 4,
            min_samples: 4,
            ..CircuitBreakerConfig::default()
        });
        // Old errors roll out of the window.
        cb.record_failure();
        cb.record_failure();
        for _ in 0..4 {
            cb.record_success();
        }
        assert_eq!(cb.error_rate(), 0.0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn consecutive_failures_reset_on_success() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.consecutive_failures(), 2);
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
    }
}
