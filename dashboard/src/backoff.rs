use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff with jitter.
///
/// The n-th delay is `initial * 2^n`, capped at `max`, plus up to half of
/// that again at random.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next retry, without jitter.
    pub fn base_delay(&self) -> Duration {
        let factor = 2_u32.saturating_pow(self.attempt.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ceiling = base.as_millis() as u64 / 2;
        let jitter = if jitter_ceiling > 0 {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let expected = [100, 200, 400, 800, 1000, 1000];

        for base in expected {
            assert_eq!(backoff.base_delay(), Duration::from_millis(base));
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(base));
            assert!(delay <= Duration::from_millis(base + base / 2));
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(5));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.base_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_large_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30));
        for _ in 0..100 {
            backoff.next_delay();
        }
        assert_eq!(backoff.base_delay(), Duration::from_secs(30));
    }
}
