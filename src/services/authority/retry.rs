//! Bounded retries for authority transport failures
//!
//! Only failures where the request never produced an answer are worth
//! repeating. A timeout is not retried: the cache already bounds every
//! authority call by a single deadline and a retry would exceed it.

use futures::Future;
use rand::Rng;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use super::AuthorityError;

/// Retry policy for authority calls
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction of the base delay added or removed at random, 0.0 to 1.0
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            strategy: BackoffStrategy::ExponentialWithJitter,
            jitter_ratio: 0.3,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    /// initial_delay * attempt
    Linear,
    /// initial_delay * 2^attempt
    Exponential,
    ExponentialWithJitter,
}

/// Errors that can tell whether another attempt might succeed
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for AuthorityError {
    fn is_retryable(&self) -> bool {
        matches!(self, AuthorityError::Unreachable(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation`, retrying retryable failures per the configured policy
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        let start_time = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(
                            attempt = %attempt,
                            total_duration_ms = %start_time.elapsed().as_millis(),
                            "Authority call succeeded after retry"
                        );
                    }
                    return Ok(result);
                }
                Err(error) if !error.is_retryable() => {
                    debug!(attempt = %attempt, error = %error, "Authority call failed with non-retryable error");
                    return Err(error);
                }
                Err(error) if attempt > self.config.max_attempts => {
                    warn!(
                        attempts = %attempt,
                        total_duration_ms = %start_time.elapsed().as_millis(),
                        error = %error,
                        "Authority call failed after all retry attempts"
                    );
                    return Err(error);
                }
                Err(error) => {
                    let delay = self.calculate_delay(attempt - 1);
                    debug!(
                        attempt = %attempt,
                        delay_ms = %delay.as_millis(),
                        error = %error,
                        "Authority call failed, retrying after delay"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Delay before retry number `attempt` (0-indexed)
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let initial_ms = self.config.initial_delay.as_millis() as u64;
        let base_delay = match self.config.strategy {
            BackoffStrategy::Fixed => self.config.initial_delay,
            BackoffStrategy::Linear => Duration::from_millis(initial_ms.saturating_mul(attempt as u64 + 1)),
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                let multiplier = 2_u64.saturating_pow(attempt);
                Duration::from_millis(initial_ms.saturating_mul(multiplier))
            }
        };

        let capped_delay = std::cmp::min(base_delay, self.config.max_delay);

        match self.config.strategy {
            BackoffStrategy::ExponentialWithJitter => self.apply_jitter(capped_delay),
            _ => capped_delay,
        }
    }

    fn apply_jitter(&self, base_delay: Duration) -> Duration {
        let base_ms = base_delay.as_millis() as u64;
        let jitter_amount = (base_ms as f64 * self.config.jitter_ratio.clamp(0.0, 1.0)) as u64;
        if jitter_amount == 0 {
            return base_delay;
        }
        let offset = rand::thread_rng().gen_range(0..=jitter_amount * 2);
        Duration::from_millis((base_ms + offset).saturating_sub(jitter_amount))
    }
}
