//! Exponential backoff
//!
//! The delay after attempt `n` (1-based) is `base * factor^(n-1)`, capped at
//! `max`. `limit` counts every attempt, the first one included.

use std::time::Duration;

use crate::models::RetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub limit: u32,
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(limit: u32, base: Duration, factor: f64, max: Duration) -> Self {
        Self {
            limit: limit.max(1),
            base,
            factor: factor.max(1.0),
            max,
        }
    }

    /// Delay to wait after a failed `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.base.as_millis() as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Whether another attempt may follow `attempt`.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.limit
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.limit,
            config.backoff.base(),
            config.backoff.factor,
            config.backoff.max(),
        )
    }
}
