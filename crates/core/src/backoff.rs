//! Exponential retry backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default exponent base.
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

/// Delay in milliseconds before the next attempt: `base^attempts * 1000`.
///
/// `attempts` is the attempt count *after* the failure that triggered the
/// backoff. Saturates at `u64::MAX` instead of overflowing.
pub fn delay_ms(attempts: u32, base: u32) -> u64 {
    u64::from(base).saturating_pow(attempts).saturating_mul(1000)
}

/// Backoff curve with a configurable time unit.
///
/// With the default unit of one second, `delay(a)` equals
/// `Duration::from_millis(delay_ms(a, base))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: u32,
    pub unit: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE)
    }
}

impl BackoffPolicy {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            unit: Duration::from_secs(1),
        }
    }

    /// Scale the curve by a different unit (tests use milliseconds).
    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    /// Delay before the attempt following `attempts` failures.
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = u64::from(self.base).saturating_pow(attempts);
        let nanos = self.unit.as_nanos().saturating_mul(u128::from(factor));
        let secs = nanos / 1_000_000_000;
        if secs > u128::from(u64::MAX) {
            return Duration::MAX;
        }
        Duration::new(secs as u64, (nanos % 1_000_000_000) as u32)
    }
}
