use std::thread;
use std::time::Duration;

/// The sleep schedule followed by threads that lost a phase mutex race or are waiting for other
/// threads of the trial.
///
/// Two shapes are available:
///
/// * [`floor_jump()`][Self::floor_jump] advances as `next = max(floor, previous * 2)`. With the
///   default parameters this sleeps 1 ms once, then jumps to 1024 ms and keeps doubling from
///   there without an upper bound. This is the schedule used by [`BackoffPolicy::default()`].
/// * [`exponential()`][Self::exponential] advances as `next = min(max, previous * 2)`, giving the
///   smooth ramp 1, 2, 4, 8 ... ms.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use trial_bench::BackoffPolicy;
///
/// let policy = BackoffPolicy::exponential(Duration::from_millis(1), Duration::from_millis(8));
/// let mut backoff = policy.start();
///
/// let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
/// assert_eq!(
///     delays,
///     [1, 2, 4, 8, 8].map(Duration::from_millis).to_vec()
/// );
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackoffPolicy {
    initial: Duration,
    growth: Growth,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Growth {
    FloorJump { floor: Duration },
    Exponential { max: Duration },
}

const DEFAULT_INITIAL: Duration = Duration::from_millis(1);
const DEFAULT_FLOOR: Duration = Duration::from_millis(1024);

impl BackoffPolicy {
    /// Sleeps `initial` first, then `max(floor, previous * 2)` for every following poll.
    #[must_use]
    pub const fn floor_jump(initial: Duration, floor: Duration) -> Self {
        Self {
            initial,
            growth: Growth::FloorJump { floor },
        }
    }

    /// Sleeps `initial` first, then doubles the sleep for every following poll up to `max`.
    #[must_use]
    pub const fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            growth: Growth::Exponential { max },
        }
    }

    /// Starts a new backoff sequence following this policy.
    #[must_use]
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            next: self.initial,
        }
    }

    fn advance(&self, previous: Duration) -> Duration {
        let doubled = previous.saturating_mul(2);

        match self.growth {
            Growth::FloorJump { floor } => doubled.max(floor),
            Growth::Exponential { max } => doubled.min(max),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::floor_jump(DEFAULT_INITIAL, DEFAULT_FLOOR)
    }
}

/// One running sequence of backoff delays.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    next: Duration,
}

impl Backoff {
    /// Returns the delay to sleep for now and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = self.policy.advance(current);
        current
    }

    /// Sleeps the current thread for the next delay in the sequence.
    #[cfg_attr(test, mutants::skip)] // Sleeping less or not at all is not observable by tests.
    pub fn snooze(&mut self) {
        thread::sleep(self.next_delay());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    #[test]
    fn default_policy_jumps_straight_to_floor() {
        let mut backoff = BackoffPolicy::default().start();

        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay()).collect();

        assert_eq!(delays, millis(&[1, 1024, 2048, 4096]));
    }

    #[test]
    fn exponential_policy_ramps_and_caps() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(1), Duration::from_millis(16));
        let mut backoff = policy.start();

        let delays: Vec<_> = (0..7).map(|_| backoff.next_delay()).collect();

        assert_eq!(delays, millis(&[1, 2, 4, 8, 16, 16, 16]));
    }

    #[test]
    fn each_start_is_independent() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(2), Duration::from_millis(8));

        let mut first = policy.start();
        _ = first.next_delay();
        _ = first.next_delay();

        let mut second = policy.start();
        assert_eq!(second.next_delay(), Duration::from_millis(2));
        assert_eq!(first.next_delay(), Duration::from_millis(8));
    }
}
