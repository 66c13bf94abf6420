//! Jittered exponential reconnect backoff (§4.1 "Reconnect backoff").

use std::time::Duration;

use rand::Rng;

/// `D(n) = min(max, base * 2^(n-1)) * (1 + U(-jitter, +jitter))`.
///
/// `n` is the number of consecutive failed attempts since the last successful connect; it resets
/// to zero on every success.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    /// Base delay for the first retry.
    pub base: Duration,
    /// Upper bound on the un-jittered delay.
    pub max: Duration,
    /// Fractional jitter applied symmetrically, e.g. `0.1` for ±10%.
    pub jitter: f64,
    /// Consecutive failures before the circuit breaker opens.
    pub circuit_breaker_threshold: u32,
    /// How long the circuit stays open once tripped.
    pub circuit_breaker_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.1,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl ReconnectPolicy {
    /// Compute the delay before attempt number `n` (1-indexed: the first retry is `n = 1`).
    #[must_use]
    pub fn next_delay(&self, n: u32) -> Duration {
        self.next_delay_with_rng(n, &mut rand::thread_rng())
    }

    /// Same as [`Self::next_delay`] but with an injectable RNG, for deterministic unit tests.
    #[must_use]
    pub fn next_delay_with_rng(&self, n: u32, rng: &mut impl Rng) -> Duration {
        if n == 0 {
            return Duration::ZERO;
        }
        let exp = n.saturating_sub(1).min(32);
        let unjittered = self.base.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        let unjittered = unjittered.min(self.max);

        let jitter_factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        let millis = (unjittered.as_secs_f64() * jitter_factor).max(0.0);
        Duration::from_secs_f64(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn first_attempt_uses_base_delay() {
        let policy = ReconnectPolicy::default();
        let mut rng = StepRng::new(u64::MAX / 2, 0); // mid-range -> ~zero jitter
        let delay = policy.next_delay_with_rng(1, &mut rng);
        assert!((delay.as_secs_f64() - 1.0).abs() < 0.2);
    }

    #[test]
    fn delay_is_capped_at_max() {
        let policy = ReconnectPolicy::default();
        let mut rng = StepRng::new(u64::MAX / 2, 0);
        let delay = policy.next_delay_with_rng(20, &mut rng);
        assert!(delay.as_secs_f64() <= policy.max.as_secs_f64() * (1.0 + policy.jitter) + 0.01);
    }

    #[test]
    fn zero_attempt_is_zero_delay() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.next_delay(0), Duration::ZERO);
    }
}
