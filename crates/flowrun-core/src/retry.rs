use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff shared by step retries and stream reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Maximum number of retries. `0` means never retry.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Scale each delay by a random factor in 0.8..1.2.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 { 5 }
fn default_base_delay() -> u64 { 500 }
fn default_multiplier() -> f64 { 2.0 }
fn default_max_delay() -> u64 { 30_000 }
fn default_jitter() -> bool { true }

impl BackoffPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// A policy that retries immediately; used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    /// Whether retry number `retry` (1-based) is within budget.
    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_attempts
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(32) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let ms = raw.min(self.max_delay_ms as f64);
        let ms = if self.jitter {
            // Add jitter: 0.8x to 1.2x
            ms * (0.8 + rand::random::<f64>() * 0.4)
        } else {
            ms
        };
        Duration::from_millis(ms as u64)
    }
}
