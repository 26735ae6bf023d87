//! Retry policy: decides backoff delays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows with each failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// factor = 1
    Fixed,
    /// factor = attempts
    Linear,
    /// factor = multiplier^(attempts - 1)
    Exponential,
}

/// Retry policy for failed tasks.
///
/// `next_delay(attempts) = min(base_delay * factor(attempts), max_delay)`,
/// where `attempts` counts attempts already made (1-indexed). The factor is
/// non-decreasing in `attempts` for every variant.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub backoff: Backoff,
    /// Only used by `Backoff::Exponential`.
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            backoff: Backoff::Exponential,
            multiplier,
            max_delay,
        }
    }

    pub fn factor(&self, attempts: u32) -> f64 {
        match self.backoff {
            Backoff::Fixed => 1.0,
            Backoff::Linear => f64::from(attempts.max(1)),
            Backoff::Exponential => {
                let exp = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
                self.multiplier.powi(exp)
            }
        }
    }

    pub fn next_delay(&self, attempts: u32) -> Duration {
        let max_secs = self.max_delay.as_secs_f64();
        let secs = (self.base_delay.as_secs_f64() * self.factor(attempts)).min(max_secs);
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }
}

/// Upper bound for every configured duration.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

/// std -> chrono, saturating at `MAX_DURATION`.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(365);
    chrono::Duration::from_std(d).map_or(cap, |c| c.min(cap))
}

/// `at + d`, clamped to the latest representable time instead of panicking.
pub fn add_saturating(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
