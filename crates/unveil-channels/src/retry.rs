//! Retry policy for channel sends.

use std::time::Duration;

use unveil_core::config::RetryConfig;

/// Bounded retry schedule. Only Retryable failures consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `delays[n - 1]`; the last entry repeats.
    pub delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delays,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        )
    }

    /// Backoff to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.delays.is_empty() {
            return Duration::ZERO;
        }
        let idx = (attempt.saturating_sub(1) as usize).min(self.delays.len() - 1);
        self.delays[idx]
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
