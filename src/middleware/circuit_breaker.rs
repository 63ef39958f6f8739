//! Circuit breaker for calls to the permission authority
//!
//! When the authority keeps failing, the breaker opens and rejects calls
//! immediately instead of letting every cache miss wait out a timeout. The
//! cache treats a rejection like any other transport failure: nothing is
//! cached, stale entries keep serving until their hard ceiling, and misses
//! fail closed.
//!
//! # State Transitions
//!
//! - **Closed → Open**: after `failure_threshold` consecutive failures
//! - **Open → HalfOpen**: once `half_open_timeout` has passed since the last failure
//! - **HalfOpen → Closed**: after `success_threshold` consecutive successes
//! - **HalfOpen → Open**: on any failure during recovery

use futures::Future;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Consecutive successes needed to close the circuit from half-open
    pub success_threshold: u32,
    /// Upper bound on a single guarded call
    pub timeout: Duration,
    /// Wait before letting a trial call through an open circuit
    pub half_open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(5),
            half_open_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
    total_operations: u64,
    successful_operations: u64,
    failed_operations: u64,
    rejected_operations: u64,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_state_change: Instant::now(),
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            rejected_operations: 0,
        }
    }
}

/// Why a guarded call did not produce a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the call was never made
    CircuitOpen,
    Timeout,
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "Circuit breaker is open"),
            CircuitBreakerError::Timeout => write!(f, "Operation timed out"),
            CircuitBreakerError::Inner(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for CircuitBreakerError<E> {}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub rejected_operations: u64,
    /// Percentage of attempted operations that succeeded
    pub success_rate: f64,
    pub current_failure_count: u32,
    #[serde(skip)]
    pub time_since_last_state_change: Duration,
    #[serde(skip)]
    pub time_until_half_open: Option<Duration>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<RwLock<CircuitBreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        debug!(
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            timeout_ms = config.timeout.as_millis(),
            half_open_timeout_ms = config.half_open_timeout.as_millis(),
            "Creating circuit breaker"
        );

        Self {
            config,
            state: Arc::new(RwLock::new(CircuitBreakerState::default())),
        }
    }

    /// Run `f` through the breaker
    ///
    /// Open circuits reject without calling `f`. Calls that exceed the
    /// configured timeout count as failures.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let should_attempt = {
            let mut state = self.state.write().await;
            state.total_operations += 1;

            match state.state {
                CircuitState::Closed | CircuitState::HalfOpen => true,
                CircuitState::Open => {
                    let cooled_down = state
                        .last_failure_time
                        .is_some_and(|last_failure| last_failure.elapsed() >= self.config.half_open_timeout);
                    if cooled_down {
                        self.transition_to_half_open(&mut state);
                        true
                    } else {
                        state.rejected_operations += 1;
                        false
                    }
                }
            }
        };

        if !should_attempt {
            debug!("Circuit breaker is open - rejecting call");
            return Err(CircuitBreakerError::CircuitOpen);
        }

        let start_time = Instant::now();
        let result = tokio::time::timeout(self.config.timeout, f()).await;
        let duration = start_time.elapsed();

        match result {
            Ok(Ok(value)) => {
                self.on_success(duration).await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure().await;
                debug!(
                    error = %e,
                    duration_ms = %duration.as_millis(),
                    "Circuit breaker: operation failed"
                );
                Err(CircuitBreakerError::Inner(e))
            }
            Err(_) => {
                self.on_failure().await;
                warn!(
                    timeout_ms = %self.config.timeout.as_millis(),
                    "Circuit breaker: operation timed out"
                );
                Err(CircuitBreakerError::Timeout)
            }
        }
    }

    async fn on_success(&self, duration: Duration) {
        let mut state = self.state.write().await;
        state.successful_operations += 1;

        debug!(
            duration_ms = %duration.as_millis(),
            state = %state.state,
            "Circuit breaker: operation succeeded"
        );

        match state.state {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    self.transition_to_closed(&mut state);
                }
            }
            CircuitState::Open => {}
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.write().await;
        state.failed_operations += 1;
        state.last_failure_time = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    self.transition_to_open(&mut state);
                }
            }
            // Any failure while probing reopens immediately
            CircuitState::HalfOpen => self.transition_to_open(&mut state),
            CircuitState::Open => {}
        }
    }

    fn transition_to_closed(&self, state: &mut CircuitBreakerState) {
        info!(
            previous_state = %state.state,
            success_count = %state.success_count,
            "Circuit breaker: transitioning to CLOSED"
        );
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.last_state_change = Instant::now();
    }

    fn transition_to_open(&self, state: &mut CircuitBreakerState) {
        warn!(
            previous_state = %state.state,
            failure_count = %state.failure_count,
            failure_threshold = %self.config.failure_threshold,
            "Circuit breaker: transitioning to OPEN"
        );
        state.state = CircuitState::Open;
        state.success_count = 0;
        state.last_state_change = Instant::now();
        state.last_failure_time = Some(Instant::now());
    }

    fn transition_to_half_open(&self, state: &mut CircuitBreakerState) {
        info!(
            previous_state = %state.state,
            time_since_failure = ?state.last_failure_time.map(|t| t.elapsed()),
            "Circuit breaker: transitioning to HALF-OPEN"
        );
        state.state = CircuitState::HalfOpen;
        state.success_count = 0;
        state.last_state_change = Instant::now();
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    pub async fn is_open(&self) -> bool {
        self.state.read().await.state == CircuitState::Open
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.read().await;
        let attempted = state.successful_operations + state.failed_operations;

        let success_rate = if attempted > 0 {
            (state.successful_operations as f64 / attempted as f64) * 100.0
        } else {
            0.0
        };

        let time_until_half_open = match (state.state, state.last_failure_time) {
            (CircuitState::Open, Some(last_failure)) => {
                Some(self.config.half_open_timeout.saturating_sub(last_failure.elapsed()))
            }
            _ => None,
        };

        CircuitBreakerStats {
            state: state.state,
            total_operations: state.total_operations,
            successful_operations: state.successful_operations,
            failed_operations: state.failed_operations,
            rejected_operations: state.rejected_operations,
            success_rate,
            current_failure_count: state.failure_count,
            time_since_last_state_change: state.last_state_change.elapsed(),
            time_until_half_open,
        }
    }

    /// Back to closed with zeroed counters
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        info!(previous_state = %state.state, "Circuit breaker: manual reset");
        *state = CircuitBreakerState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(failure_threshold: u32, half_open_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 1,
            timeout: Duration::from_millis(50),
            half_open_timeout: Duration::from_millis(half_open_ms),
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_starts_closed() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(!breaker.is_open().await);
    }

    #[tokio::test]
    async fn test_inner_error_is_returned_unchanged() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());

        let result = breaker.call(|| async { Err::<(), _>("refused") }).await;

        assert_eq!(result.unwrap_err(), CircuitBreakerError::Inner("refused"));
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_failures_and_rejects() {
        let breaker = CircuitBreaker::new(config(2, 10_000));

        let _ = breaker.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        let _ = breaker.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let result = breaker
            .call(|| async move {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        assert_eq!(result.unwrap_err(), CircuitBreakerError::CircuitOpen);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.stats().await.rejected_operations, 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(config(1, 10_000));

        let result = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, String>(())
            })
            .await;

        assert_eq!(result.unwrap_err(), CircuitBreakerError::Timeout);
        assert!(breaker.is_open().await);
    }

    #[tokio::test]
    async fn test_half_open_trial_call_closes_circuit() {
        let breaker = CircuitBreaker::new(config(1, 20));

        let _ = breaker.call(|| async { Err::<(), _>("error") }).await;
        assert!(breaker.is_open().await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let result = breaker.call(|| async { Ok::<_, String>("trial") }).await;

        assert_eq!(result.unwrap(), "trial");
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_clears_counters() {
        let breaker = CircuitBreaker::new(config(1, 10_000));
        let _ = breaker.call(|| async { Err::<(), _>("error") }).await;
        breaker.reset().await;

        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.total_operations, 0);
    }
}
