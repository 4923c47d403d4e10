use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff between retry attempts.
///
/// The delay after the `n`-th failed attempt is
/// `min(max_ms, base_ms * multiplier^(n - 1))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub base_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 2_000,
            multiplier: 2.0,
            max_ms: 60_000,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            multiplier,
            max_ms: max.as_millis() as u64,
        }
    }

    /// Delay before retrying after `attempt` failed attempts (1-based).
    /// Attempt 0 has nothing to wait for.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = if scaled.is_finite() {
            scaled.min(self.max_ms as f64)
        } else {
            self.max_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}
