//! Circuit breaker for external model and vector dependencies.
//!
//! Three states: closed (calls permitted), open (calls rejected for a
//! recovery timeout), half-open (one probe permitted). The breaker trips
//! when the failure count inside a sliding window reaches the threshold.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Normal operation — calls are permitted.
    Closed,
    /// Too many failures — calls are blocked.
    Open { since: Instant },
    /// Recovery probe — one call is permitted to test the dependency.
    HalfOpen,
}

/// Serializable snapshot of a breaker for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateLabel {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitStateLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitStateLabel::Closed => write!(f, "closed"),
            CircuitStateLabel::Open => write!(f, "open"),
            CircuitStateLabel::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A circuit breaker that trips after `failure_threshold` failures within
/// `failure_window` and recovers through a half-open probe.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: CircuitState,
    failures: VecDeque<Instant>,
    failure_threshold: usize,
    failure_window: Duration,
    open_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: usize,
        failure_window: Duration,
        open_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            failure_threshold: failure_threshold.max(1),
            failure_window,
            open_timeout,
        }
    }

    /// Whether a call is currently permitted. An open breaker past its
    /// timeout transitions to half-open and admits one probe.
    pub fn is_call_permitted(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { since } => {
                if since.elapsed() >= self.open_timeout {
                    debug!(breaker = %self.name, "Circuit transitioning to half-open");
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    /// Record a successful call. Closes the breaker and clears the window.
    pub fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            debug!(breaker = %self.name, "Circuit closing after successful probe");
        }
        self.failures.clear();
        self.state = CircuitState::Closed;
    }

    /// Record a failed call. A half-open probe failure reopens
    /// immediately; in closed state the windowed count decides.
    pub fn record_failure(&mut self) {
        let now = Instant::now();
        if self.state == CircuitState::HalfOpen {
            warn!(breaker = %self.name, "Probe failed, circuit reopening");
            self.state = CircuitState::Open { since: now };
            return;
        }

        self.failures.push_back(now);
        let cutoff = now - self.failure_window;
        while self.failures.front().is_some_and(|t| *t < cutoff) {
            self.failures.pop_front();
        }

        if self.failures.len() >= self.failure_threshold {
            warn!(
                breaker = %self.name,
                failures = self.failures.len(),
                threshold = self.failure_threshold,
                "Circuit opening"
            );
            self.state = CircuitState::Open { since: now };
        }
    }

    /// Seconds until an open breaker admits a probe (0 otherwise).
    pub fn retry_after_secs(&self) -> u64 {
        match self.state {
            CircuitState::Open { since } => {
                self.open_timeout.saturating_sub(since.elapsed()).as_secs()
            }
            _ => 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn label(&self) -> CircuitStateLabel {
        match self.state {
            CircuitState::Closed => CircuitStateLabel::Closed,
            CircuitState::Open { .. } => CircuitStateLabel::Open,
            CircuitState::HalfOpen => CircuitStateLabel::HalfOpen,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: usize, open_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            threshold,
            Duration::from_secs(60),
            Duration::from_millis(open_ms),
        )
    }

    #[test]
    fn test_starts_closed() {
        let cb = breaker(3, 1000);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.label(), CircuitStateLabel::Closed);
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = breaker(3, 1000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
        assert!(!cb.is_call_permitted());
    }

    #[test]
    fn test_failures_outside_window_do_not_trip() {
        let mut cb = CircuitBreaker::new(
            "test",
            2,
            Duration::from_millis(10),
            Duration::from_secs(30),
        );
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        cb.record_failure();
        // The first failure aged out of the window.
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_timeout() {
        let mut cb = breaker(1, 1);
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));

        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.is_call_permitted());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_probe_success_closes() {
        let mut cb = breaker(1, 1);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        cb.is_call_permitted();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let mut cb = breaker(1, 1);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        cb.is_call_permitted();
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
    }

    #[test]
    fn test_success_clears_window() {
        let mut cb = breaker(3, 1000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_retry_after_counts_down() {
        let mut cb = CircuitBreaker::new(
            "test",
            1,
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        assert_eq!(cb.retry_after_secs(), 0);
        cb.record_failure();
        assert!(cb.retry_after_secs() <= 30);
        assert!(cb.retry_after_secs() >= 29);
    }
}
