//! # Retry Policy
//!
//! Exponential backoff with bounded jitter. The delay before retry `n`
//! (zero-based) is `min(max_delay, base_delay * exponential_base^n)`, scaled
//! by up to `jitter_ratio` of random jitter and capped again at `max_delay`.
//!
//! With `jitter_ratio <= exponential_base - 1` the delay sequence is
//! non-decreasing for any jitter draw.

use std::time::Duration;

use config_rs::ResilienceSettings;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Backoff multiplier applied per retry
    pub exponential_base: f64,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            exponential_base: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.1,
        }
    }
}

impl From<&ResilienceSettings> for RetryPolicy {
    fn from(settings: &ResilienceSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: settings.base_delay(),
            exponential_base: settings.exponential_base,
            max_delay: settings.max_delay(),
            jitter_ratio: settings.jitter_ratio,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio;
        self
    }

    /// Delay before retry `attempt` (zero-based) for a jitter sample in `[0, 1]`
    pub fn delay_for(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped = if raw.is_finite() { raw.min(max) } else { max };

        let sample = jitter_sample.clamp(0.0, 1.0);
        let jittered = (capped * (1.0 + self.jitter_ratio * sample)).min(max);

        Duration::try_from_secs_f64(jittered).unwrap_or(self.max_delay)
    }

    /// Delay before retry `attempt` with a fresh random jitter draw
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_for(attempt, sample)
    }

    /// Jitter-free delays between consecutive attempts
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.delay_for(attempt, 0.0))
            .collect()
    }
}
