//! Retry scheduling policies.
//!
//! A policy is a pure function of the retry count, apart from jitter. The
//! exponential policy doubles a base delay per retry up to a cap and scales
//! the result by a uniform multiplier in [0.5, 1.5] so concurrent retries
//! spread out; the fixed policy is deterministic.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay for every retry.
    Fixed { delay_ms: u64 },
    /// `min(cap, base * 2^retry)`, jittered.
    Exponential { base_ms: u64, cap_ms: u64 },
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn exponential(base: Duration, cap: Duration) -> Self {
        BackoffPolicy::Exponential {
            base_ms: base.as_millis() as u64,
            cap_ms: cap.as_millis() as u64,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffPolicy::Exponential { base_ms, cap_ms } => {
                let uncapped = base_ms.saturating_mul(2u64.saturating_pow(retry.min(63)));
                let capped = uncapped.min(*cap_ms);
                let jitter = rand::thread_rng().gen_range(0.5..=1.5);
                Duration::from_millis((capped as f64 * jitter) as u64)
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: 1_000,
            cap_ms: 60_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_is_deterministic() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(10), Duration::from_millis(100));
    }

    #[test]
    fn exponential_grows_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base_ms: 100,
            cap_ms: 5_000,
        };
        // Jitter scales by at most 1.5x and at least 0.5x of the capped value.
        for retry in 1..=20 {
            let delay = policy.delay_for(retry).as_millis() as u64;
            assert!(delay <= 7_500, "retry {} gave {}ms", retry, delay);
        }
        let late = policy.delay_for(16).as_millis() as u64;
        assert!(late >= 2_500, "capped delay should stay near the cap, got {}ms", late);
    }

    #[test]
    fn exponential_does_not_overflow() {
        let policy = BackoffPolicy::Exponential {
            base_ms: u64::MAX / 2,
            cap_ms: 1_000,
        };
        assert!(policy.delay_for(u32::MAX).as_millis() <= 1_500);
    }

    #[test]
    fn policy_serde_round_trip() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(60));
        let json = serde_json::to_string(&policy).unwrap();
        let back: BackoffPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
