use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RetryConfig;

/// Backoff schedule for retry batches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retry: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Randomize delays by ±20%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retry: config.max_retry,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            jitter: true,
        }
    }

    /// Delay before attempt number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        if !self.jitter {
            return Duration::from_millis(ms);
        }
        // Add jitter: 0.8x to 1.2x
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    }

    /// When the batch should be retried after `attempt` attempts so far.
    pub fn next_retry_time(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.backoff(attempt))
            .unwrap_or_else(|_| chrono::Duration::milliseconds(self.max_backoff_ms as i64));
        now + delay
    }
}
