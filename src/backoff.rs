//! Reconnect backoff
//!
//! The delay for attempt `n` (0-indexed) is `first × factor^n`, clamped to
//! `max`, with jitter applied to the clamped value. The base is derived from the
//! attempt number alone, so a short jittered delay never drags later delays
//! down.

use rand::Rng;
use std::time::Duration;

/// How randomness is mixed into a backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterPolicy {
    /// Exact delay
    None,
    /// Uniform in `[0, base]`
    Full,
    /// Uniform in `[base / 2, base]`
    Equal,
}

impl JitterPolicy {
    pub fn apply(&self, base: Duration) -> Duration {
        match self {
            JitterPolicy::None => base,
            JitterPolicy::Full => {
                let ms = whole_millis(base);
                if ms == 0 {
                    return base;
                }
                Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
            }
            JitterPolicy::Equal => {
                let ms = whole_millis(base);
                let half = ms / 2;
                if ms == 0 {
                    return base;
                }
                Duration::from_millis(half + rand::thread_rng().gen_range(0..=ms - half))
            }
        }
    }
}

/// Milliseconds in `d`, saturating at `u64::MAX`
fn whole_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Capped exponential backoff used between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect
    pub first: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Multiplicative growth per attempt
    pub factor: f64,
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: JitterPolicy::Equal,
        }
    }
}

impl BackoffPolicy {
    /// Fixed delay, no growth, no jitter
    pub fn constant(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Delay before reconnect attempt `attempt`, before jitter.
    pub fn base(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before reconnect attempt `attempt`, jitter applied.
    pub fn next(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.base(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }

    #[test]
    fn test_exponential_growth() {
        let policy = no_jitter();
        assert_eq!(policy.next(0), Duration::from_millis(100));
        assert_eq!(policy.next(1), Duration::from_millis(200));
        assert_eq!(policy.next(2), Duration::from_millis(400));
        assert_eq!(policy.next(4), Duration::from_millis(1600));
    }

    #[test]
    fn test_clamped_to_max() {
        let policy = BackoffPolicy {
            max: Duration::from_secs(1),
            ..no_jitter()
        };
        assert_eq!(policy.next(10), Duration::from_secs(1));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_first_exceeding_max_is_capped() {
        let policy = BackoffPolicy {
            first: Duration::from_secs(10),
            max: Duration::from_secs(5),
            ..no_jitter()
        };
        assert_eq!(policy.next(0), Duration::from_secs(5));
    }

    #[test]
    fn test_constant_policy() {
        let policy = BackoffPolicy::constant(Duration::from_millis(50));
        for attempt in 0..8 {
            assert_eq!(policy.next(attempt), Duration::from_millis(50));
        }
    }

    #[test]
    fn test_jitter_on_huge_delays_saturates() {
        let huge = Duration::MAX;
        let ceiling = Duration::from_millis(u64::MAX);

        let equal = JitterPolicy::Equal.apply(huge);
        assert!(equal >= Duration::from_millis(u64::MAX / 2), "{:?} below half", equal);
        assert!(equal <= ceiling);

        assert!(JitterPolicy::Full.apply(huge) <= ceiling);
        assert_eq!(whole_millis(huge), u64::MAX);
        assert_eq!(whole_millis(Duration::from_millis(1500)), 1500);
    }

    #[test]
    fn test_equal_jitter_bounds() {
        let policy = BackoffPolicy {
            jitter: JitterPolicy::Equal,
            ..no_jitter()
        };
        for attempt in 0..12 {
            let base = policy.base(attempt);
            let delay = policy.next(attempt);
            assert!(delay >= base / 2, "attempt {}: {:?} < half of {:?}", attempt, delay, base);
            assert!(delay <= base, "attempt {}: {:?} > {:?}", attempt, delay, base);
        }
    }

    #[test]
    fn test_full_jitter_never_exceeds_base() {
        let policy = BackoffPolicy {
            jitter: JitterPolicy::Full,
            ..no_jitter()
        };
        for attempt in 0..12 {
            assert!(policy.next(attempt) <= policy.base(attempt));
        }
    }
}
