//! # Recovery Policy Module
//!
//! Implements exponential backoff for consumer restarts and start-time
//! declaration retries.
//!
//! Provides configurable backoff with jitter to prevent thundering herd
//! problems when many consumers recover at once.

use rand::RngExt;
use serde::Deserialize;
use std::time::Duration;

/// Backoff policy for consumer recovery
///
/// # Examples
///
/// ```rust
/// use listener_runtime::retry::RecoveryPolicy;
/// use std::time::Duration;
///
/// // Default policy: 5s initial, 60s max, 2.0x multiplier
/// let policy = RecoveryPolicy::default();
///
/// // Custom policy
/// let policy = RecoveryPolicy::new(Duration::from_millis(500), Duration::from_secs(5), 1.5);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Delay before the first restart attempt, in milliseconds
    pub initial_interval_millis: u64,

    /// Maximum delay between restart attempts, in milliseconds
    pub max_interval_millis: u64,

    /// Exponential backoff multiplier (typically 2.0)
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays (recommended)
    pub use_jitter: bool,

    /// Jitter range as percentage (default 25% = ±25%)
    pub jitter_percent: f64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_millis: 5_000,
            max_interval_millis: 60_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_percent: 0.25, // ±25%
        }
    }
}

impl RecoveryPolicy {
    /// Create a new recovery policy
    ///
    /// # Arguments
    ///
    /// * `initial_interval` - Delay before the first restart attempt
    /// * `max_interval` - Maximum delay cap
    /// * `backoff_multiplier` - Exponential growth factor (typically 1.5-2.0)
    pub fn new(initial_interval: Duration, max_interval: Duration, backoff_multiplier: f64) -> Self {
        Self {
            initial_interval_millis: initial_interval.as_millis() as u64,
            max_interval_millis: max_interval.as_millis() as u64,
            backoff_multiplier,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }

    /// Disable jitter (not recommended for production)
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Set custom jitter percentage (0.0 to 1.0)
    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Delay before the first restart attempt
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_millis)
    }

    /// Calculate delay for a specific restart attempt
    ///
    /// Uses exponential backoff: delay = initial * multiplier^attempt,
    /// capped at the maximum interval, with jitter if enabled.
    ///
    /// # Arguments
    ///
    /// * `attempt` - Restart attempt number (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let initial = Duration::from_millis(self.initial_interval_millis);
        let base_delay_secs = initial.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);

        let max = Duration::from_millis(self.max_interval_millis);
        let capped_delay_secs = base_delay_secs.min(max.as_secs_f64());

        let final_delay_secs = if self.use_jitter {
            Self::add_jitter(capped_delay_secs, self.jitter_percent)
        } else {
            capped_delay_secs
        };

        Duration::from_secs_f64(final_delay_secs)
    }

    /// Add jitter to a delay value
    ///
    /// Applies random variation in range [delay * (1-jitter), delay * (1+jitter)]
    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let mut rng = rand::rng();

        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let jitter = rng.random_range(-jitter_range..=jitter_range);

        (delay_secs + jitter).max(0.0)
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
