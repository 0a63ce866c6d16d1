use std::time::Duration;

use rand::Rng;

/// Reconnect backoff and circuit breaker tuning.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts that open the circuit.
    pub max_attempts: u32,
    /// How long the open circuit blocks new attempts.
    pub cooldown: Duration,
    /// Fraction of the delay randomized in either direction. Zero keeps the
    /// schedule strictly non-decreasing.
    pub jitter_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            max_attempts: 5,
            cooldown: Duration::from_secs(30),
            jitter_factor: 0.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let exp_ms = self.base_delay.as_millis() as f64 * 2.0_f64.powi(exponent);
        let capped = exp_ms.min(self.max_delay.as_millis() as f64);

        if self.jitter_factor <= 0.0 {
            return Duration::from_millis(capped as u64);
        }

        let spread = capped * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        let final_ms = (capped + jitter).clamp(0.0, self.max_delay.as_millis() as f64);
        Duration::from_millis(final_ms as u64)
    }

    /// True once `attempts` consecutive failures should open the circuit.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_doubles_then_caps() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 16, 16]);
    }

    #[test]
    fn schedule_is_monotonic_without_jitter() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let mut last = Duration::ZERO;
        for attempt in 1..=40 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= last, "attempt {attempt}: {delay:?} < {last:?}");
            assert!(delay <= policy.max_delay);
            last = delay;
        }
    }

    #[test]
    fn jitter_stays_within_cap() {
        let policy = ReconnectPolicy {
            jitter_factor: 0.5,
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for(3);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(6));
            assert!(policy.delay_for(10) <= policy.max_delay);
        }
    }

    #[test]
    fn exhaustion_threshold() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }
}
