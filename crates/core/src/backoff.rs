//! Reconnect backoff policy.
//!
//! Geometric growth by a factor of 1.7 (floored to whole milliseconds), capped
//! at a maximum delay, with an optional budget on the cumulative time spent
//! waiting since the last successful connect.

use std::time::Duration;

use crate::options::ClientOptions;

/// Outcome of asking the policy for the next retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Wait this long, then try again.
    Wait(Duration),
    /// The cumulative retry budget is spent; give up.
    Exhausted { total: Duration },
}

/// Backoff state for one logical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    budget: Option<Duration>,
    current: Duration,
    total: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, budget: Option<Duration>) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            budget,
            current: min,
            total: Duration::ZERO,
            attempts: 0,
        }
    }

    pub fn from_options(options: &ClientOptions) -> Self {
        Self::new(
            options.min_retry_delay(),
            options.max_retry_delay(),
            options.max_total_retry(),
        )
    }

    /// Grow the delay and account for it.
    ///
    /// The first call after construction or [`Backoff::reset`] already grows
    /// from the minimum (100ms -> 170ms with defaults).
    pub fn next(&mut self) -> BackoffStep {
        let current_ms = u64::try_from(self.current.as_millis()).unwrap_or(u64::MAX);
        let grown = Duration::from_millis(current_ms.saturating_mul(17) / 10);

        self.current = grown.min(self.max);
        self.total = self.total.saturating_add(self.current);
        self.attempts = self.attempts.saturating_add(1);

        match self.budget {
            Some(budget) if self.total > budget => BackoffStep::Exhausted { total: self.total },
            _ => BackoffStep::Wait(self.current),
        }
    }

    /// Back to the minimum delay with an empty retry budget.
    pub fn reset(&mut self) {
        self.current = self.min;
        self.total = Duration::ZERO;
        self.attempts = 0;
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Cumulative delay since the last reset.
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Retries scheduled since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn grows_by_1_7_and_floors() {
        let mut backoff = Backoff::new(ms(100), ms(300_000), None);

        assert_eq!(backoff.next(), BackoffStep::Wait(ms(170)));
        assert_eq!(backoff.next(), BackoffStep::Wait(ms(289)));
        assert_eq!(backoff.next(), BackoffStep::Wait(ms(491)));
        assert_eq!(backoff.next(), BackoffStep::Wait(ms(834)));
        assert_eq!(backoff.total(), ms(170 + 289 + 491 + 834));
        assert_eq!(backoff.attempts(), 4);
    }

    #[test]
    fn caps_at_max_delay() {
        let mut backoff = Backoff::new(ms(100), ms(400), None);

        assert_eq!(backoff.next(), BackoffStep::Wait(ms(170)));
        assert_eq!(backoff.next(), BackoffStep::Wait(ms(289)));
        assert_eq!(backoff.next(), BackoffStep::Wait(ms(400)));
        assert_eq!(backoff.next(), BackoffStep::Wait(ms(400)));
    }

    #[test]
    fn reset_restores_minimum_and_clears_total() {
        let mut backoff = Backoff::new(ms(100), ms(10_000), None);
        backoff.next();
        backoff.next();

        backoff.reset();

        assert_eq!(backoff.current(), ms(100));
        assert_eq!(backoff.total(), Duration::ZERO);
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next(), BackoffStep::Wait(ms(170)));
    }

    #[test]
    fn budget_exhaustion_is_reported_once_total_exceeds_it() {
        // 170 + 289 = 459 <= 500, then + 491 = 950 > 500
        let mut backoff = Backoff::new(ms(100), ms(10_000), Some(ms(500)));

        assert_eq!(backoff.next(), BackoffStep::Wait(ms(170)));
        assert_eq!(backoff.next(), BackoffStep::Wait(ms(289)));
        assert_eq!(backoff.next(), BackoffStep::Exhausted { total: ms(950) });
    }

    #[test]
    fn max_below_min_is_raised_to_min() {
        let mut backoff = Backoff::new(ms(200), ms(50), None);
        assert_eq!(backoff.next(), BackoffStep::Wait(ms(200)));
    }

    proptest! {
        #[test]
        fn delay_strictly_increases_until_capped(min in 2u64..5_000, extra in 0u64..600_000, steps in 1usize..40) {
            let max = min + extra;
            let mut backoff = Backoff::new(ms(min), ms(max), None);
            let mut previous = ms(min);

            for _ in 0..steps {
                let BackoffStep::Wait(delay) = backoff.next() else {
                    panic!("unbounded budget never exhausts");
                };
                prop_assert!(delay <= ms(max));
                if previous < ms(max) {
                    prop_assert!(delay > previous);
                } else {
                    prop_assert_eq!(delay, ms(max));
                }
                previous = delay;
            }
        }

        #[test]
        fn total_is_sum_of_waits(min in 1u64..1_000, steps in 1usize..30) {
            let mut backoff = Backoff::new(ms(min), ms(60_000), None);
            let mut sum = Duration::ZERO;
            for _ in 0..steps {
                if let BackoffStep::Wait(delay) = backoff.next() {
                    sum += delay;
                }
            }
            prop_assert_eq!(backoff.total(), sum);
        }
    }
}
