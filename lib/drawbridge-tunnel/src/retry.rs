//! Backoff and jitter shapes shared by the periodic loops.

use std::time::Duration;

use rand::Rng;

/// Uniform in `[d*6/7, d]`, used by heartbeat and resync loops to avoid
/// herd effects.
pub fn seventh_jitter(duration: Duration) -> Duration {
    let floor = duration.mul_f64(6.0 / 7.0);
    sample_between(floor, duration)
}

/// Uniform in `[d/2, d]`
pub fn half_jitter(duration: Duration) -> Duration {
    sample_between(duration / 2, duration)
}

fn sample_between(floor: Duration, ceil: Duration) -> Duration {
    if ceil <= floor {
        return ceil;
    }
    let nanos = rand::thread_rng().gen_range(floor.as_nanos()..=ceil.as_nanos());
    Duration::from_nanos(nanos as u64)
}

/// Jittered exponential backoff for reconnect loops
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// The next delay: `min(cap, base * 2^attempt)` with seventh-jitter
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        seventh_jitter(exp)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Linear backoff with a cap, used by the session tracker refresh loop
pub struct LinearBackoff {
    step: Duration,
    cap: Duration,
    attempt: u32,
}

impl LinearBackoff {
    pub fn new(step: Duration, cap: Duration) -> Self {
        Self {
            step,
            cap,
            attempt: 0,
        }
    }

    /// The next delay: `min(cap, step * n)` with half-jitter
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let linear = self.step.saturating_mul(self.attempt).min(self.cap);
        half_jitter(linear)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seventh_jitter_bounds() {
        let base = Duration::from_secs(7);
        for _ in 0..100 {
            let jittered = seventh_jitter(base);
            assert!(jittered >= Duration::from_secs(6), "{jittered:?}");
            assert!(jittered <= base, "{jittered:?}");
        }
    }

    #[test]
    fn half_jitter_bounds() {
        let base = Duration::from_secs(60);
        for _ in 0..100 {
            let jittered = half_jitter(base);
            assert!(jittered >= Duration::from_secs(30), "{jittered:?}");
            assert!(jittered <= base, "{jittered:?}");
        }
    }

    #[test]
    fn exponential_backoff_caps() {
        let cap = Duration::from_secs(8);
        let mut backoff = Backoff::new(Duration::from_secs(1), cap);

        let mut previous_max = Duration::ZERO;
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay <= cap);
            previous_max = previous_max.max(delay);
        }
        // the sequence reaches the cap region
        assert!(previous_max > cap.mul_f64(6.0 / 7.0) - Duration::from_millis(1));

        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_secs(1));
    }

    #[test]
    fn linear_backoff_grows_to_cap() {
        let mut backoff = LinearBackoff::new(Duration::from_secs(60), Duration::from_secs(180));

        let first = backoff.next_delay();
        assert!(first <= Duration::from_secs(60));

        for _ in 0..5 {
            backoff.next_delay();
        }
        let later = backoff.next_delay();
        assert!(later <= Duration::from_secs(180));
        assert!(later >= Duration::from_secs(90));
    }
}
