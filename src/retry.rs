//! Backoff schedule for retrying coordination-store operations.

use rand::{thread_rng, Rng};
use std::time::Duration;

/// Multiplicative backoff with a uniform growth factor in `[1, 2)`.
///
/// The first delay is returned as-is; every subsequent delay is the previous
/// one multiplied by a freshly drawn factor, saturating at `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_bounds(Duration::from_millis(100), Duration::from_secs(10))
    }

    pub fn with_bounds(initial: Duration, cap: Duration) -> Self {
        Self {
            current: initial.min(cap),
            cap,
        }
    }

    /// Returns the delay to sleep before the next attempt and advances the
    /// schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        if self.current < self.cap {
            let factor = thread_rng().gen_range(1.0..2.0);
            let grown_ms = (self.current.as_millis() as f64 * factor).round() as u64;
            self.current = Duration::from_millis(grown_ms).min(self.cap);
        }
        delay
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delay_is_initial() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn delays_grow_within_factor_bounds() {
        let mut backoff = Backoff::new();
        let mut previous = backoff.next_delay();
        for _ in 0..8 {
            let next = backoff.next_delay();
            assert!(next >= previous, "schedule must be monotonic");
            assert!(
                next <= previous.saturating_mul(2),
                "growth factor must stay below 2"
            );
            previous = next;
        }
    }

    #[test]
    fn delays_saturate_at_cap() {
        let mut backoff = Backoff::with_bounds(Duration::from_millis(100), Duration::from_secs(10));
        for _ in 0..64 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn initial_above_cap_is_clamped() {
        let mut backoff = Backoff::with_bounds(Duration::from_secs(30), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }
}
