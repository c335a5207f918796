//! Reconnect delay policy.
//!
//! The broker connection is re-established forever after a failure; this
//! module only decides how long to wait between attempts. With the defaults
//! the wait is a flat 3 seconds (`base == max`, no jitter).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 3000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 3000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.0;

/// Reconnect backoff parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Delay before the first retry, doubled per consecutive failure.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on the doubled delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Symmetric jitter range; 0.2 varies the delay by ±20%.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero-based), with `random` in
    /// `[0.0, 1.0)` mapped onto `[-jitter, +jitter]`.
    ///
    /// Formula: `min(max, base * 2^attempt) * (1 + (2r - 1) * jitter)`
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(31));
        let capped = exponential.min(self.max_delay_ms);

        let jitter = 1.0 + (random * 2.0 - 1.0) * self.jitter_factor.clamp(0.0, 1.0);
        let with_jitter = (capped as f64) * jitter;

        Duration::from_millis(with_jitter.round().max(0.0) as u64)
    }

    /// Delay before retry number `attempt`, drawing jitter from the thread RNG.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if self.jitter_factor <= 0.0 {
            return self.delay_with_random(attempt, 0.5);
        }
        self.delay_with_random(attempt, rand::random::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base: u64, max: u64, jitter: f64) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay_ms: base,
            max_delay_ms: max,
            jitter_factor: jitter,
        }
    }

    #[test]
    fn default_is_flat_three_seconds() {
        let p = ReconnectPolicy::default();
        for attempt in [0, 1, 5, 40] {
            assert_eq!(p.next_delay(attempt), Duration::from_secs(3));
        }
    }

    #[test]
    fn doubles_until_capped() {
        let p = policy(100, 1000, 0.0);
        assert_eq!(p.delay_with_random(0, 0.5), Duration::from_millis(100));
        assert_eq!(p.delay_with_random(1, 0.5), Duration::from_millis(200));
        assert_eq!(p.delay_with_random(3, 0.5), Duration::from_millis(800));
        assert_eq!(p.delay_with_random(4, 0.5), Duration::from_millis(1000));
        assert_eq!(p.delay_with_random(31, 0.5), Duration::from_millis(1000));
    }

    #[test]
    fn huge_attempt_saturates() {
        let p = policy(u64::MAX / 2, u64::MAX, 0.0);
        assert_eq!(p.delay_with_random(u32::MAX, 0.5).as_millis(), u128::from(u64::MAX));
    }

    #[test]
    fn jitter_bounds() {
        let p = policy(1000, 60_000, 0.2);
        assert_eq!(p.delay_with_random(0, 0.0), Duration::from_millis(800));
        assert_eq!(p.delay_with_random(0, 0.5), Duration::from_millis(1000));
        assert!(p.delay_with_random(0, 0.999_999) <= Duration::from_millis(1200));
    }

    #[test]
    fn random_jitter_stays_in_range() {
        let p = policy(1000, 1000, 0.5);
        for _ in 0..100 {
            let d = p.next_delay(0).as_millis();
            assert!((500..=1500).contains(&d), "{d}");
        }
    }

    #[test]
    fn serde_defaults_fill_missing_fields() {
        let p: ReconnectPolicy = serde_json::from_str(r#"{"maxDelayMs": 30000}"#).unwrap();
        assert_eq!(p.base_delay_ms, DEFAULT_BASE_DELAY_MS);
        assert_eq!(p.max_delay_ms, 30_000);
        assert!(p.jitter_factor.abs() < f64::EPSILON);
    }
}
