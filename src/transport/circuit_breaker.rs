//! Circuit breaker (§4.1 "Circuit breaker").

use std::time::{Duration, Instant};

/// Opens after a configured number of consecutive connection failures, suspending reconnects for
/// a cooldown period. A success at any point resets the failure count and closes the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a breaker that opens after `threshold` consecutive failures for `timeout`.
    #[must_use]
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            threshold,
            timeout,
            consecutive_failures: 0,
            open_until: None,
        }
    }

    /// Record a failed connection attempt, possibly opening the circuit.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            self.open_until = Some(Instant::now() + self.timeout);
        }
    }

    /// Record a successful connection, resetting the failure count and closing the circuit.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }

    /// If the circuit is currently open, the instant at which it will close.
    #[must_use]
    pub fn open_until(&mut self) -> Option<Instant> {
        if let Some(until) = self.open_until {
            if Instant::now() >= until {
                self.open_until = None;
                self.consecutive_failures = 0;
                return None;
            }
        }
        self.open_until
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.open_until().is_none());
        breaker.record_failure();
        assert!(breaker.open_until().is_some());
    }

    #[test]
    fn success_resets_failure_count() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(breaker.open_until().is_none());
    }

    #[test]
    fn closes_after_timeout_elapses() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.record_failure();
        assert!(breaker.open_until().is_some());
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.open_until().is_none());
    }
}
