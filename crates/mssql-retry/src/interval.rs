//! Wait-interval strategies between retry attempts.
//!
//! An [`IntervalPolicy`] is an immutable description of a strategy. Each
//! retried call gets its own [`IntervalGenerator`] from
//! [`IntervalPolicy::generator`], so concurrent calls sharing one policy never
//! race on the attempt counter.
//!
//! Every strategy except [`IntervalKind::None`] multiplies its step by a random
//! factor in `[0.8, 1.2]` so that many clients failing at the same moment do
//! not retry in lockstep.

use std::time::Duration;

use crate::config::ConfigError;

/// Largest delta, minimum or maximum interval accepted.
pub const MAX_INTERVAL: Duration = Duration::from_secs(120);

const JITTER_LOW: f64 = 0.8;
const JITTER_SPAN: f64 = 0.4;

/// Largest exponent used by the exponential strategy.
const MAX_EXPONENT: u32 = 62;

/// The interval strategy family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntervalKind {
    /// Always zero; retrying still goes through the same execution path.
    None,
    /// The configured delta, jittered.
    Fixed,
    /// Previous interval plus the jittered delta.
    Incremental,
    /// `(2^n - 1)` times the jittered delta, `n` advancing on every call.
    Exponential,
}

/// An interval strategy with its bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalPolicy {
    kind: IntervalKind,
    delta: Duration,
    min: Duration,
    max: Duration,
}

impl Default for IntervalPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl IntervalPolicy {
    fn with_kind(kind: IntervalKind, delta: Duration) -> Self {
        Self {
            kind,
            delta,
            min: Duration::ZERO,
            max: MAX_INTERVAL,
        }
    }

    /// A policy that never waits.
    #[must_use]
    pub fn none() -> Self {
        Self::with_kind(IntervalKind::None, Duration::ZERO)
    }

    /// A fixed interval around `delta`.
    #[must_use]
    pub fn fixed(delta: Duration) -> Self {
        Self::with_kind(IntervalKind::Fixed, delta)
    }

    /// An interval growing by roughly `delta` on every attempt.
    #[must_use]
    pub fn incremental(delta: Duration) -> Self {
        Self::with_kind(IntervalKind::Incremental, delta)
    }

    /// An interval growing exponentially from `delta`.
    #[must_use]
    pub fn exponential(delta: Duration) -> Self {
        Self::with_kind(IntervalKind::Exponential, delta)
    }

    /// Set the lower bound. Smaller intervals are clamped up to it.
    #[must_use]
    pub fn min_interval(mut self, min: Duration) -> Self {
        self.min = min;
        self
    }

    /// Set the upper bound. Larger intervals are capped at it.
    #[must_use]
    pub fn max_interval(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// The strategy family.
    #[must_use]
    pub fn kind(&self) -> IntervalKind {
        self.kind
    }

    /// The configured step.
    #[must_use]
    pub fn delta(&self) -> Duration {
        self.delta
    }

    /// The lower bound.
    #[must_use]
    pub fn min(&self) -> Duration {
        self.min
    }

    /// The upper bound.
    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Validate the bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [("delta", self.delta), ("min", self.min), ("max", self.max)] {
            if value > MAX_INTERVAL {
                return Err(ConfigError::IntervalOutOfRange {
                    name,
                    value,
                    max: MAX_INTERVAL,
                });
            }
        }
        if self.min > self.max {
            return Err(ConfigError::MinAboveMax {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    /// Create fresh per-call state positioned at the first attempt.
    #[must_use]
    pub fn generator(&self) -> IntervalGenerator {
        IntervalGenerator {
            policy: self.clone(),
            attempt: 1,
            current: Duration::ZERO,
        }
    }
}

/// Stateful producer of successive wait intervals.
#[derive(Debug, Clone)]
pub struct IntervalGenerator {
    policy: IntervalPolicy,
    attempt: u32,
    current: Duration,
}

impl IntervalGenerator {
    /// Produce the next interval and advance.
    pub fn next_interval(&mut self) -> Duration {
        let p = &self.policy;
        let step = p.delta.as_secs_f64() * jitter();

        let raw = match p.kind {
            IntervalKind::None => return Duration::ZERO,
            IntervalKind::Fixed => step,
            IntervalKind::Incremental => self.current.as_secs_f64() + step,
            IntervalKind::Exponential => {
                let exponent = self.attempt.min(MAX_EXPONENT) as i32;
                (2f64.powi(exponent) - 1.0) * step
            }
        };

        let capped = raw.min(p.max.as_secs_f64()).max(0.0);
        self.current = Duration::from_secs_f64(capped).clamp(p.min, p.max.max(p.min));
        self.attempt = self.attempt.saturating_add(1);
        self.current
    }

    /// The most recently produced interval.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return to the first attempt.
    pub fn reset(&mut self) {
        self.attempt = 1;
        self.current = Duration::ZERO;
    }
}

impl Iterator for IntervalGenerator {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_interval())
    }
}

fn jitter() -> f64 {
    JITTER_LOW + rand::random::<f64>() * JITTER_SPAN
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIN: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(2);

    #[test]
    fn test_none_is_always_zero() {
        let mut generator = IntervalPolicy::none().generator();
        assert!(generator.by_ref().take(10).all(|d| d.is_zero()));
    }

    #[test]
    fn test_fixed_is_jittered_around_delta() {
        let mut generator = IntervalPolicy::fixed(Duration::from_secs(1)).generator();
        for interval in generator.by_ref().take(200) {
            assert!(interval >= Duration::from_millis(799), "{interval:?}");
            assert!(interval <= Duration::from_millis(1201), "{interval:?}");
        }
    }

    #[test]
    fn test_incremental_grows_until_capped() {
        let policy = IntervalPolicy::incremental(Duration::from_millis(500)).max_interval(MAX);
        let mut generator = policy.generator();
        let first = generator.next_interval();
        let second = generator.next_interval();
        assert!(second > first);

        let last = generator.by_ref().take(20).last().unwrap();
        assert_eq!(last, MAX);
    }

    #[test]
    fn test_exponential_grows_and_resets() {
        let policy = IntervalPolicy::exponential(Duration::from_millis(100));
        let mut generator = policy.generator();
        let first = generator.next_interval();
        generator.next_interval();
        let third = generator.next_interval();
        // 1x vs 7x the jittered delta.
        assert!(third > first);

        generator.reset();
        assert_eq!(generator.current(), Duration::ZERO);
        let again = generator.next_interval();
        assert!(again <= Duration::from_millis(121));
    }

    #[test]
    fn test_exponential_saturates_at_max() {
        let mut generator = IntervalPolicy::exponential(Duration::from_secs(1))
            .max_interval(Duration::from_secs(10))
            .generator();
        let last = generator.by_ref().take(200).last().unwrap();
        assert_eq!(last, Duration::from_secs(10));
    }

    #[test]
    fn test_min_clamps_small_intervals() {
        let mut generator = IntervalPolicy::fixed(Duration::from_millis(1))
            .min_interval(Duration::from_millis(50))
            .generator();
        assert_eq!(generator.next_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(IntervalPolicy::fixed(Duration::from_secs(121)).validate().is_err());
        let err = IntervalPolicy::fixed(Duration::from_secs(1))
            .min_interval(Duration::from_secs(5))
            .max_interval(Duration::from_secs(2))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("greater than"));
        assert!(IntervalPolicy::exponential(MIN).max_interval(MAX).validate().is_ok());
    }

    #[test]
    fn test_generators_are_independent() {
        let policy = IntervalPolicy::exponential(Duration::from_millis(10));
        let mut a = policy.generator();
        for _ in 0..5 {
            a.next_interval();
        }
        let mut b = policy.generator();
        assert!(b.next_interval() <= Duration::from_millis(12));
    }

    proptest! {
        #[test]
        fn incremental_stays_within_bounds(delta_ms in 0u64..5_000) {
            let policy = IntervalPolicy::incremental(Duration::from_millis(delta_ms))
                .min_interval(MIN)
                .max_interval(MAX);
            let mut generator = policy.generator();
            for interval in generator.by_ref().take(1000) {
                prop_assert!(interval >= MIN && interval <= MAX);
            }
        }

        #[test]
        fn exponential_stays_within_bounds(delta_ms in 0u64..5_000) {
            let policy = IntervalPolicy::exponential(Duration::from_millis(delta_ms))
                .min_interval(MIN)
                .max_interval(MAX);
            let mut generator = policy.generator();
            for interval in generator.by_ref().take(1000) {
                prop_assert!(interval >= MIN && interval <= MAX);
            }
        }
    }
}
