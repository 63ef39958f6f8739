//! Resilience decorator for authority clients
//!
//! Wraps any [`PermissionAuthorityClient`] with bounded retries of transport
//! failures and a circuit breaker around the whole retried call. Verdicts,
//! including `Deny`, count as successes for the breaker.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::retry::{RetryConfig, RetryExecutor};
use super::{AuthorityError, AuthorityStats, PermissionAuthorityClient};
use crate::auth::path::NormalizedPath;
use crate::auth::types::{AccessLevel, PermissionTree, Principal};
use crate::middleware::circuit_breaker::{CircuitBreaker, CircuitBreakerError};

pub struct GuardedAuthorityClient {
    inner: Arc<dyn PermissionAuthorityClient>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
}

impl GuardedAuthorityClient {
    pub fn new(inner: Arc<dyn PermissionAuthorityClient>, breaker: Arc<CircuitBreaker>, retry: RetryConfig) -> Self {
        Self {
            inner,
            breaker,
            retry: RetryExecutor::new(retry),
        }
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl From<CircuitBreakerError<AuthorityError>> for AuthorityError {
    fn from(error: CircuitBreakerError<AuthorityError>) -> Self {
        match error {
            CircuitBreakerError::CircuitOpen => AuthorityError::Unreachable("circuit breaker open".to_string()),
            CircuitBreakerError::Timeout => AuthorityError::Timeout,
            CircuitBreakerError::Inner(inner) => inner,
        }
    }
}

#[async_trait]
impl PermissionAuthorityClient for GuardedAuthorityClient {
    async fn check(
        &self,
        principal: &Principal,
        prefix: &NormalizedPath,
        level: AccessLevel,
        timeout: Duration,
    ) -> Result<PermissionTree, AuthorityError> {
        self.breaker
            .call(|| {
                self.retry
                    .execute(|| self.inner.check(principal, prefix, level, timeout))
            })
            .await
            .map_err(AuthorityError::from)
    }

    async fn health_check(&self) -> Result<bool, AuthorityError> {
        if self.breaker.is_open().await {
            return Ok(false);
        }
        self.inner.health_check().await
    }

    async fn stats(&self) -> AuthorityStats {
        self.inner.stats().await
    }
}
