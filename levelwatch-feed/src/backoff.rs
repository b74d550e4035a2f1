use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnection backoff policy for the upstream broker socket.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReconnectionBackoffPolicy {
    /// Initial backoff duration after the first disconnection.
    pub backoff_ms_initial: u64,

    /// Scaling factor applied on repeated failed reconnection attempts.
    pub backoff_multiplier: u8,

    /// Maximum possible backoff duration between reconnection attempts.
    pub backoff_ms_max: u64,

    /// Symmetric jitter fraction applied to every generated backoff, eg/ `0.2`
    /// spreads sleeps over ±20% of the nominal duration.
    pub jitter: f64,
}

impl Default for ReconnectionBackoffPolicy {
    fn default() -> Self {
        Self {
            backoff_ms_initial: 1_000,
            backoff_multiplier: 2,
            backoff_ms_max: 30_000,
            jitter: 0.2,
        }
    }
}

/// Mutable backoff state tracking the current delay between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectionState {
    policy: ReconnectionBackoffPolicy,
    backoff_ms_current: u64,
}

impl From<ReconnectionBackoffPolicy> for ReconnectionState {
    fn from(policy: ReconnectionBackoffPolicy) -> Self {
        Self {
            backoff_ms_current: policy.backoff_ms_initial,
            policy,
        }
    }
}

impl ReconnectionState {
    /// Reset the delay to the initial value after a successful connection.
    pub fn reset_backoff(&mut self) {
        self.backoff_ms_current = self.policy.backoff_ms_initial;
    }

    /// Next sleep duration, with jitter applied, scaling the delay for the
    /// attempt after it.
    pub fn next_backoff(&mut self) -> Duration {
        let nominal = self.backoff_ms_current;
        self.multiply_backoff();

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Duration::from_millis(nominal);
        }

        let spread = (nominal as f64) * jitter;
        let jittered = rand::rng().random_range(-spread..=spread) + nominal as f64;
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    fn multiply_backoff(&mut self) {
        let next = self
            .backoff_ms_current
            .saturating_mul(u64::from(self.policy.backoff_multiplier));
        self.backoff_ms_current = std::cmp::min(next, self.policy.backoff_ms_max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_scales_and_caps() {
        let mut state = ReconnectionState::from(ReconnectionBackoffPolicy {
            backoff_ms_initial: 1_000,
            backoff_multiplier: 2,
            backoff_ms_max: 30_000,
            jitter: 0.0,
        });

        let expected_ms = [1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000];
        for (attempt, expected) in expected_ms.into_iter().enumerate() {
            let actual = state.next_backoff();
            assert_eq!(
                actual,
                Duration::from_millis(expected),
                "attempt {attempt} produced wrong backoff"
            );
        }

        state.reset_backoff();
        assert_eq!(state.next_backoff(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let mut state = ReconnectionState::from(ReconnectionBackoffPolicy {
            backoff_ms_initial: 10_000,
            backoff_multiplier: 1,
            backoff_ms_max: 10_000,
            jitter: 0.2,
        });

        for _ in 0..100 {
            let sleep = state.next_backoff().as_millis() as u64;
            assert!((8_000..=12_000).contains(&sleep), "jittered sleep {sleep}ms out of bounds");
        }
    }
}
