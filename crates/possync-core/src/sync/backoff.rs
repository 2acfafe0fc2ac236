//! Exponential backoff with jitter

use std::time::Duration;

use rand::Rng;

/// Exponential delay capped at `cap`, with equal jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retry number `attempt` (0-based) without jitter
    pub fn ceiling(&self, attempt: u32) -> Duration {
        const MAX_EXPONENT: u32 = 20;
        let factor = 1_u32 << attempt.min(MAX_EXPONENT);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay before retry number `attempt`, randomized in `[ceiling / 2, ceiling]`
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with_jitter(attempt, jitter)
    }

    /// Deterministic variant of [`Backoff::delay`]; `jitter` is clamped to `[0, 1]`
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        half + half.mul_f64(jitter.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(2), Duration::from_secs(300))
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let backoff = backoff();
        assert_eq!(backoff.ceiling(0), Duration::from_secs(2));
        assert_eq!(backoff.ceiling(1), Duration::from_secs(4));
        assert_eq!(backoff.ceiling(2), Duration::from_secs(8));
        assert_eq!(backoff.ceiling(7), Duration::from_secs(256));
        assert_eq!(backoff.ceiling(8), Duration::from_secs(300));
        assert_eq!(backoff.ceiling(500), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = backoff();
        assert_eq!(backoff.delay_with_jitter(1, 0.0), Duration::from_secs(2));
        assert_eq!(backoff.delay_with_jitter(1, 1.0), Duration::from_secs(4));
        for _ in 0..100 {
            let delay = backoff.delay(3);
            assert!(delay >= Duration::from_secs(8) && delay <= Duration::from_secs(16));
        }
    }
}
