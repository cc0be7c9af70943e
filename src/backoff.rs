use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with a ceiling and proportional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Fraction of the delay added or removed at random, 0.0 to 1.0.
    pub jitter: f64,
    /// Connect failures in a row before an account is marked degraded.
    pub max_consecutive_failures: u32,
    /// Attempts per session call before a transient error fails the pass.
    pub max_call_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 300_000,
            jitter: 0.2,
            max_consecutive_failures: 5,
            max_call_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let capped = self.base_ms.saturating_mul(exp).min(self.max_ms);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let millis = if jitter > 0.0 && capped > 0 {
            let spread = capped as f64 * jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped as f64 + offset).max(0.0) as u64
        } else {
            capped
        };

        Duration::from_millis(millis.min(self.max_ms))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_ms == 0 {
            return Err("backoff.base_ms must be greater than zero".to_string());
        }
        if self.max_ms < self.base_ms {
            return Err("backoff.max_ms must not be below backoff.base_ms".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("backoff.jitter must be between 0.0 and 1.0".to_string());
        }
        if self.max_call_attempts == 0 || self.max_consecutive_failures == 0 {
            return Err("backoff attempt limits must be at least 1".to_string());
        }
        Ok(())
    }
}
