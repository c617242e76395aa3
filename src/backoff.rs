//! Retry delay schedule.

use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with optional jitter.
///
/// The delay after the `n`th failed attempt is `base × 2^n`, capped at `cap`.
/// Jitter adds up to half of that delay on top, then the cap is applied again.
/// Because the jitter stays under half the delay, successive delays never
/// shrink: the worst case for attempt `n` is `1.5 × base × 2^n`, which is
/// below the jitter-free delay for attempt `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: bool,
}

impl Backoff {
    /// Jittered backoff starting at `base` and never exceeding `cap`.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: true,
        }
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay to wait after `attempt` failed attempts.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);
        if !self.jitter || delay >= self.cap {
            return delay;
        }

        let spread = u64::try_from((delay / 2).as_nanos()).unwrap_or(u64::MAX);
        let jitter = Duration::from_nanos(rand::thread_rng().gen_range(0..=spread));
        delay.saturating_add(jitter).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_without_jitter() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10))
            .with_jitter(false);
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(40), Duration::from_secs(10));
    }

    #[test]
    fn jittered_delays_never_shrink_and_respect_cap() {
        let cap = Duration::from_secs(5);
        let backoff = Backoff::new(Duration::from_millis(50), cap);

        for _ in 0..200 {
            let mut previous = Duration::ZERO;
            for attempt in 1..=12 {
                let delay = backoff.delay(attempt);
                assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
                assert!(delay <= cap);
                previous = delay;
            }
        }
    }

    #[test]
    fn cap_below_base_is_raised_to_base() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(backoff.cap(), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(2));
    }
}
