//! Exponential backoff with caller-supplied jitter.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry delay policy for failed sync cycles and alert deliveries.
///
/// `delay(n) = min(max, base * multiplier^(n-1)) * (1 ± jitter)`, clamped
/// to `max`. Jitter is a sample in `[0, 1)` supplied by the caller so the
/// policy stays deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomized in either direction
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 300_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based; 0 means no wait).
    pub fn delay(&self, attempt: u32, jitter_sample: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(63) as i32;
        let raw = self.base_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_ms as f64);

        let sample = jitter_sample.clamp(0.0, 1.0);
        let spread = capped * self.jitter * (sample * 2.0 - 1.0);
        let millis = (capped + spread).clamp(0.0, self.max_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Delay without jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        self.with_jitter(0.0).delay(attempt, 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_until_cap() {
        let policy = BackoffPolicy::new(1_000, 10_000);
        assert_eq!(policy.nominal(0), Duration::ZERO);
        assert_eq!(policy.nominal(1), Duration::from_millis(1_000));
        assert_eq!(policy.nominal(2), Duration::from_millis(2_000));
        assert_eq!(policy.nominal(4), Duration::from_millis(8_000));
        assert_eq!(policy.nominal(5), Duration::from_millis(10_000));
        assert_eq!(policy.nominal(500), Duration::from_millis(10_000));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = BackoffPolicy::new(1_000, 60_000).with_jitter(0.25);
        assert_eq!(policy.delay(1, 0.0), Duration::from_millis(750));
        assert_eq!(policy.delay(1, 0.5), Duration::from_millis(1_000));
        assert_eq!(policy.delay(1, 1.0), Duration::from_millis(1_250));
    }

    #[test]
    fn jitter_never_exceeds_max() {
        let policy = BackoffPolicy::new(1_000, 4_000).with_jitter(0.5);
        assert_eq!(policy.delay(10, 1.0), Duration::from_millis(4_000));
    }
}
