use std::time::Duration;

use rand::Rng;

/// Exponential backoff for transient provider failures: 1s base doubling to
/// a 60s cap, jittered by up to 20% in either direction so concurrent
/// dispatch loops do not retry in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.cap);

        let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
        let jittered = exp.as_secs_f64() * (1.0 + jitter);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let backoff = Backoff::default();

        let d0 = backoff.delay(0);
        assert!(d0 >= Duration::from_secs_f64(0.8) && d0 <= Duration::from_secs_f64(1.2));

        let d3 = backoff.delay(3);
        assert!(d3 >= Duration::from_secs_f64(6.4) && d3 <= Duration::from_secs_f64(9.6));

        // Far past the cap, including maximum upward jitter
        let d20 = backoff.delay(20);
        assert!(d20 <= Duration::from_secs_f64(72.0));
        assert!(d20 >= Duration::from_secs_f64(48.0));
    }

    #[test]
    fn test_overflow_safe() {
        let backoff = Backoff::default();
        let d = backoff.delay(u32::MAX);
        assert!(d <= Duration::from_secs_f64(72.0));
    }
}
