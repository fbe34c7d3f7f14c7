//! Exponential-backoff schedule for MQTT reconnection.
//!
//! When the broker connection drops, the MQTT event loop sleeps for
//! [`Backoff::next_delay`] before polling again (which reconnects), and
//! calls [`Backoff::reset`] once a `CONNACK` is received.

use std::time::Duration;

/// Shape of the reconnect schedule: start at `initial`, multiply by
/// `factor` after every failed attempt, never exceed `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub ceiling: Duration,
    pub factor: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            ceiling: Duration::from_secs(32),
            factor: 2,
        }
    }
}

/// Stateful backoff: yields the delay for the current attempt and grows it.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.initial.min(policy.ceiling),
            policy,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .saturating_mul(self.policy.factor)
            .min(self.policy.ceiling);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over from the initial delay after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.policy.initial.min(self.policy.ceiling);
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_thirty_two_seconds() {
        let mut backoff = Backoff::default();
        let expected = [1, 2, 4, 8, 16, 32, 32, 32];

        for &expected_secs in &expected {
            assert_eq!(backoff.next_delay().as_secs(), expected_secs);
        }
        assert_eq!(backoff.attempt(), expected.len() as u32);
    }

    #[test]
    fn ceiling_below_a_doubling_step_clamps() {
        let mut backoff = Backoff::new(BackoffPolicy {
            initial: Duration::from_millis(300),
            ceiling: Duration::from_millis(500),
            factor: 2,
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn huge_factor_saturates_instead_of_overflowing() {
        let mut backoff = Backoff::new(BackoffPolicy {
            initial: Duration::from_secs(1),
            ceiling: Duration::MAX,
            factor: u32::MAX,
        });
        for _ in 0..8 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::MAX);
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
