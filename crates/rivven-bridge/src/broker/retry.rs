//! Retry with exponential backoff for broker operations
//!
//! Only errors that [`BrokerError::is_retryable`] accepts are retried.

use super::BrokerError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound of any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (1-indexed); zero for the first try
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let capped_attempt = attempt.min(30);
        let delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(capped_attempt as i32 - 1);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// Run `operation` until it succeeds, fails permanently or retries run out
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempts <= config.max_retries => {
                let delay = config.delay_for_attempt(attempts);
                warn!(
                    "{} attempt {} failed: {}, retrying in {:?}",
                    what, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if attempts > 1 => {
                return Err(BrokerError::Connection(format!(
                    "{} failed after {} attempts: {}",
                    what, attempts, e
                )));
            }
            Err(e) => return Err(e),
        }
    }
}
