//! Retry backoff for store round trips.
//!
//! Delays double from the initial value. Once the doubled delay would pass
//! the clamp threshold, every subsequent delay is the fixed ceiling instead:
//! with the defaults, 500ms, 1s, 2s, ... 32s, then 30 minutes forever after.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failure, in milliseconds.
    #[serde(default = "BackoffPolicy::default_initial_ms")]
    pub initial_ms: u64,
    /// Multiplier applied on each subsequent failure.
    #[serde(default = "BackoffPolicy::default_factor")]
    pub factor: f64,
    /// Delays beyond this are clamped to the ceiling, in milliseconds.
    #[serde(default = "BackoffPolicy::default_clamp_threshold_ms")]
    pub clamp_threshold_ms: u64,
    /// Fixed delay used once the threshold is passed, in milliseconds.
    #[serde(default = "BackoffPolicy::default_ceiling_ms")]
    pub ceiling_ms: u64,
}

impl BackoffPolicy {
    pub fn default_initial_ms() -> u64 {
        500
    }
    pub fn default_factor() -> f64 {
        2.0
    }
    pub fn default_clamp_threshold_ms() -> u64 {
        60_000
    }
    pub fn default_ceiling_ms() -> u64 {
        30 * 60 * 1_000
    }

    /// Delay before the next attempt, given how many attempts have already
    /// failed (0 after the first failure).
    pub fn delay_ms(&self, failures_so_far: u32) -> u64 {
        let exact = self.initial_ms as f64 * self.factor.powi(failures_so_far as i32);
        if !exact.is_finite() || exact > self.clamp_threshold_ms as f64 {
            self.ceiling_ms
        } else {
            exact.round() as u64
        }
    }

    pub fn delay(&self, failures_so_far: u32) -> Duration {
        Duration::from_millis(self.delay_ms(failures_so_far))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: Self::default_initial_ms(),
            factor: Self::default_factor(),
            clamp_threshold_ms: Self::default_clamp_threshold_ms(),
            ceiling_ms: Self::default_ceiling_ms(),
        }
    }
}
