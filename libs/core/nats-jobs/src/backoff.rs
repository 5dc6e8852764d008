//! Backoff policy for failed deliveries.

use std::time::Duration;

/// Default number of entries generated by [`exp_backoff`].
pub const DEFAULT_EXP_ENTRIES: usize = 5;

/// Delay applied before a failed message is redelivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay for every redelivery.
    Fixed(Duration),
    /// Delay indexed by redelivery count; the last entry repeats forever.
    Schedule(Vec<Duration>),
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::from_secs(1))
    }
}

impl Backoff {
    /// Doubling schedule starting at `start` with default options.
    pub fn exponential(start: Duration) -> Self {
        Backoff::Schedule(exp_backoff(start, ExpBackoffOptions::default()))
    }

    /// Backoff to apply for a message delivered `redelivery_count` times.
    ///
    /// A count of zero is treated as a first delivery.
    pub fn next_backoff(&self, redelivery_count: u64) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Schedule(delays) => {
                let index = redelivery_count.max(1) - 1;
                let index = usize::try_from(index).unwrap_or(usize::MAX);
                delays
                    .get(index)
                    .or_else(|| delays.last())
                    .copied()
                    .unwrap_or(Duration::ZERO)
            }
        }
    }
}

impl From<Duration> for Backoff {
    fn from(delay: Duration) -> Self {
        Backoff::Fixed(delay)
    }
}

impl From<Vec<Duration>> for Backoff {
    fn from(delays: Vec<Duration>) -> Self {
        Backoff::Schedule(delays)
    }
}

/// Options for [`exp_backoff`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpBackoffOptions {
    /// Number of entries to generate. Defaults to 5.
    pub num_entries: Option<usize>,
    /// Stop doubling after this many entries. Defaults to `num_entries`.
    pub repeat_after: Option<usize>,
}

impl ExpBackoffOptions {
    pub fn with_num_entries(mut self, num_entries: usize) -> Self {
        self.num_entries = Some(num_entries);
        self
    }

    pub fn with_repeat_after(mut self, repeat_after: usize) -> Self {
        self.repeat_after = Some(repeat_after);
        self
    }
}

/// Generate a doubling list of delays starting at `start`.
///
/// Zero values in the options fall back to their defaults.
pub fn exp_backoff(start: Duration, options: ExpBackoffOptions) -> Vec<Duration> {
    let num_entries = options
        .num_entries
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_EXP_ENTRIES);
    let repeat_after = options
        .repeat_after
        .filter(|n| *n > 0)
        .unwrap_or(num_entries);

    let mut delays = Vec::with_capacity(num_entries);
    let mut delay = start;
    for i in 0..num_entries {
        delays.push(delay);
        if i + 1 < repeat_after {
            delay = delay.saturating_mul(2);
        }
    }
    delays
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    #[test]
    fn test_exp_backoff_defaults() {
        let delays = exp_backoff(Duration::from_secs(1), ExpBackoffOptions::default());
        assert_eq!(delays, ms(&[1000, 2000, 4000, 8000, 16000]));
    }

    #[test]
    fn test_exp_backoff_num_entries() {
        let opts = ExpBackoffOptions::default().with_num_entries(3);
        assert_eq!(exp_backoff(Duration::from_secs(1), opts), ms(&[1000, 2000, 4000]));
    }

    #[test]
    fn test_exp_backoff_repeat_after() {
        let opts = ExpBackoffOptions::default().with_repeat_after(3);
        assert_eq!(
            exp_backoff(Duration::from_secs(1), opts),
            ms(&[1000, 2000, 4000, 4000, 4000])
        );
    }

    #[test]
    fn test_schedule_backoff_lookup() {
        let backoff = Backoff::from(ms(&[1000, 2000, 3000]));
        assert_eq!(backoff.next_backoff(1), Duration::from_millis(1000));
        assert_eq!(backoff.next_backoff(2), Duration::from_millis(2000));
        assert_eq!(backoff.next_backoff(5), Duration::from_millis(3000));
    }

    #[test]
    fn test_zero_count_is_first_delivery() {
        let backoff = Backoff::from(ms(&[250, 500]));
        assert_eq!(backoff.next_backoff(0), Duration::from_millis(250));
    }

    #[test]
    fn test_empty_schedule_is_zero() {
        assert_eq!(Backoff::Schedule(vec![]).next_backoff(3), Duration::ZERO);
    }

    #[test]
    fn test_default_backoff() {
        assert_eq!(Backoff::default(), Backoff::Fixed(Duration::from_secs(1)));
        assert_eq!(
            Backoff::exponential(Duration::from_millis(100)).next_backoff(10),
            Duration::from_millis(1600)
        );
    }

    proptest! {
        #[test]
        fn fixed_backoff_ignores_count(delay_ms in 0u64..100_000, count in 0u64..1_000) {
            let backoff = Backoff::Fixed(Duration::from_millis(delay_ms));
            prop_assert_eq!(backoff.next_backoff(count), Duration::from_millis(delay_ms));
        }

        #[test]
        fn schedule_backoff_indexes_or_clamps(
            delays in prop::collection::vec(0u64..60_000, 1..10),
            count in 1u64..50,
        ) {
            let schedule = ms(&delays);
            let backoff = Backoff::Schedule(schedule.clone());
            let expected = schedule
                .get(count as usize - 1)
                .copied()
                .unwrap_or(*schedule.last().unwrap());
            prop_assert_eq!(backoff.next_backoff(count), expected);
        }

        #[test]
        fn exp_backoff_doubles_then_holds(
            start_ms in 1u64..10_000,
            num_entries in 1usize..12,
            repeat_after in 1usize..12,
        ) {
            let opts = ExpBackoffOptions::default()
                .with_num_entries(num_entries)
                .with_repeat_after(repeat_after);
            let delays = exp_backoff(Duration::from_millis(start_ms), opts);

            prop_assert_eq!(delays.len(), num_entries);
            prop_assert_eq!(delays[0], Duration::from_millis(start_ms));
            for i in 1..delays.len() {
                if i < repeat_after {
                    prop_assert_eq!(delays[i], delays[i - 1] * 2);
                } else {
                    prop_assert_eq!(delays[i], delays[i - 1]);
                }
            }
        }
    }
}
