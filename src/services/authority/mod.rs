//! Permission authority clients
//!
//! The permission authority is the external system of record for per-path
//! grants. Clients in this module answer one question: what may a principal
//! do at a path prefix and everywhere below it? The answer is a
//! [`PermissionTree`] rooted at the prefix. Clients do no caching;
//! [`crate::auth::cache::PermissionCache`] sits in front of them.
//!
//! Implementations:
//!
//! - [`http::HttpAuthorityClient`] talks to the platform auth service over HTTP
//! - [`static_client::StaticAuthorityClient`] evaluates in-process grant rules
//!   (demo deployments and tests)
//! - [`guarded::GuardedAuthorityClient`] wraps another client with a circuit
//!   breaker and bounded retries of transport failures

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::auth::path::NormalizedPath;
use crate::auth::types::{AccessLevel, PermissionTree, Principal};

pub mod guarded;
pub mod http;
pub mod retry;
pub mod static_client;

pub use guarded::GuardedAuthorityClient;
pub use http::{HttpAuthorityClient, HttpAuthorityConfig};
pub use static_client::StaticAuthorityClient;

/// Authority call failure. Never cached.
///
/// Clone so a single in-flight result can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    #[error("permission authority unreachable: {0}")]
    Unreachable(String),

    #[error("permission authority timed out")]
    Timeout,

    #[error("malformed permission authority response: {0}")]
    MalformedResponse(String),
}

impl AuthorityError {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthorityError::Unreachable(_) => "unreachable",
            AuthorityError::Timeout => "timeout",
            AuthorityError::MalformedResponse(_) => "malformed_response",
        }
    }
}

/// Counters for authority client monitoring
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthorityStats {
    pub total_checks: u64,
    pub allowed: u64,
    pub denied: u64,
    pub failed_checks: u64,
    pub timeouts: u64,
    pub connection_errors: u64,
    /// Exponential moving average, alpha 0.1
    pub avg_response_time_ms: f64,
}

impl AuthorityStats {
    pub(crate) fn record(&mut self, result: &Result<PermissionTree, AuthorityError>, duration: Duration) {
        self.total_checks += 1;
        match result {
            Ok(tree) if tree.verdict.is_allow() => self.allowed += 1,
            Ok(_) => self.denied += 1,
            Err(error) => {
                self.failed_checks += 1;
                match error {
                    AuthorityError::Timeout => self.timeouts += 1,
                    AuthorityError::Unreachable(_) => self.connection_errors += 1,
                    AuthorityError::MalformedResponse(_) => {}
                }
            }
        }

        let duration_ms = duration.as_secs_f64() * 1000.0;
        if self.total_checks == 1 {
            self.avg_response_time_ms = duration_ms;
        } else {
            self.avg_response_time_ms = 0.1 * duration_ms + 0.9 * self.avg_response_time_ms;
        }
    }
}

/// Client for the external permission authority
#[async_trait]
pub trait PermissionAuthorityClient: Send + Sync {
    /// Fetch `principal`'s permission tree rooted at `prefix`
    ///
    /// `timeout` bounds the whole call. The tree must cover the complete
    /// subtree so that any descendant can be answered from it. `Allow`
    /// verdicts carry the full level granted, which may exceed `level`.
    async fn check(
        &self,
        principal: &Principal,
        prefix: &NormalizedPath,
        level: AccessLevel,
        timeout: Duration,
    ) -> Result<PermissionTree, AuthorityError>;

    /// Whether the authority is currently reachable
    async fn health_check(&self) -> Result<bool, AuthorityError> {
        Ok(true)
    }

    async fn stats(&self) -> AuthorityStats {
        AuthorityStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::AuthorityVerdict;

    #[test]
    fn test_stats_track_outcomes_and_average() {
        let mut stats = AuthorityStats::default();
        stats.record(
            &Ok(PermissionTree::new(AuthorityVerdict::Allow(AccessLevel::Read))),
            Duration::from_millis(10),
        );
        assert_eq!(stats.avg_response_time_ms, 10.0);

        stats.record(&Ok(PermissionTree::new(AuthorityVerdict::Deny)), Duration::from_millis(20));
        stats.record(&Err(AuthorityError::Timeout), Duration::from_millis(20));
        stats.record(&Err(AuthorityError::Unreachable("refused".into())), Duration::from_millis(20));

        assert_eq!(stats.total_checks, 4);
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.failed_checks, 2);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.connection_errors, 1);
        assert!(stats.avg_response_time_ms > 10.0 && stats.avg_response_time_ms < 20.0);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(AuthorityError::Timeout.kind(), "timeout");
        assert_eq!(AuthorityError::Unreachable("x".into()).kind(), "unreachable");
        assert_eq!(AuthorityError::MalformedResponse("x".into()).kind(), "malformed_response");
    }
}
