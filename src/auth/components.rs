//! Authorization components for dependency injection
//!
//! Builds the authority client, permission cache and path authorizer from
//! configuration so the server and tests wire them the same way.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::auth::audit::{AuditSink, TracingAuditSink};
use crate::auth::authorizer::PathAuthorizer;
use crate::auth::cache::{CacheConfig, CacheStats, Invalidation, PermissionCache};
use crate::auth::path::NormalizedPath;
use crate::auth::types::Principal;
use crate::config::{AuthorityMode, AuthorizationConfig};
use crate::error::AppError;
use crate::middleware::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::services::authority::retry::RetryConfig;
use crate::services::authority::{
    AuthorityStats, GuardedAuthorityClient, HttpAuthorityClient, HttpAuthorityConfig, PermissionAuthorityClient,
    StaticAuthorityClient,
};

/// Everything needed to answer authorization questions
#[derive(Clone)]
pub struct AuthorizationComponents {
    pub authority: Arc<dyn PermissionAuthorityClient>,
    pub cache: PermissionCache,
    pub authorizer: PathAuthorizer,
    /// Present when the authority is remote
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl AuthorizationComponents {
    pub fn from_config(config: &AuthorizationConfig) -> Result<Self, AppError> {
        let (authority, circuit_breaker): (Arc<dyn PermissionAuthorityClient>, _) = match config.authority_mode {
            AuthorityMode::Http => {
                let http = HttpAuthorityClient::new(HttpAuthorityConfig {
                    endpoint: config.authority_endpoint.clone(),
                    token: config.authority_token.clone().unwrap_or_default(),
                    cluster_name: config.cluster_name.clone(),
                    ..HttpAuthorityConfig::default()
                })
                .map_err(|e| AppError::Config(e.to_string()))?;

                let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
                    failure_threshold: config.circuit_breaker_failure_threshold,
                    success_threshold: config.circuit_breaker_success_threshold,
                    timeout: Duration::from_millis(config.authority_timeout_ms),
                    half_open_timeout: Duration::from_secs(config.circuit_breaker_retry_timeout_s),
                }));
                let retry = RetryConfig::default().with_max_attempts(config.retry_max_attempts);

                info!(
                    endpoint = %config.authority_endpoint,
                    cluster = %config.cluster_name,
                    "Using HTTP permission authority"
                );
                let guarded = GuardedAuthorityClient::new(Arc::new(http), breaker.clone(), retry);
                (Arc::new(guarded), Some(breaker))
            }
            AuthorityMode::Static => {
                let grants = config
                    .static_grants
                    .iter()
                    .map(|grant| {
                        let path = NormalizedPath::parse(&grant.path)
                            .map_err(|e| AppError::Config(format!("invalid grant path {}: {}", grant.path, e)))?;
                        Ok((Principal::new(grant.principal.clone()), path, grant.level))
                    })
                    .collect::<Result<Vec<_>, AppError>>()?;

                info!(grants = grants.len(), "Using static permission authority");
                (Arc::new(StaticAuthorityClient::with_grants(grants)), None)
            }
        };

        let mut components = Self::with_client(authority, cache_config(config), Arc::new(TracingAuditSink))?;
        components.circuit_breaker = circuit_breaker;
        Ok(components)
    }

    /// Wire components around an existing authority client
    pub fn with_client(
        authority: Arc<dyn PermissionAuthorityClient>,
        cache_config: CacheConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, AppError> {
        let cache = PermissionCache::new(cache_config, authority.clone())?;
        let authorizer = PathAuthorizer::new(cache.clone(), audit);
        Ok(Self {
            authority,
            cache,
            authorizer,
            circuit_breaker: None,
        })
    }

    /// Start the sweeper, and the invalidation listener when a channel is given
    pub fn start_background_tasks(&self, invalidations: Option<mpsc::Receiver<Invalidation>>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.cache.spawn_sweeper()];
        if let Some(receiver) = invalidations {
            handles.push(self.cache.spawn_invalidation_listener(receiver));
        }
        handles
    }

    pub async fn get_stats(&self) -> AuthorizationStats {
        let circuit_breaker = match &self.circuit_breaker {
            Some(breaker) => Some(breaker.stats().await),
            None => None,
        };
        AuthorizationStats {
            cache: self.cache.stats(),
            authority: self.authority.stats().await,
            circuit_breaker,
        }
    }
}

pub fn cache_config(config: &AuthorizationConfig) -> CacheConfig {
    CacheConfig {
        expiration_interval: Duration::from_secs(config.permission_expiration_interval_s),
        forgetting_interval: Duration::from_secs(config.permission_forgetting_interval_s),
        authority_timeout: Duration::from_millis(config.authority_timeout_ms),
        refresh_retry_backoff: Duration::from_millis(config.refresh_retry_backoff_ms),
        max_entries: config.cache_max_entries,
        sweep_interval: Duration::from_secs(config.cache_sweep_interval_s),
    }
}

/// Statistics about the authorization system
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationStats {
    pub cache: CacheStats,
    pub authority: AuthorityStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::AccessLevel;
    use crate::config::StaticGrant;

    fn static_config() -> AuthorizationConfig {
        AuthorizationConfig {
            authority_mode: AuthorityMode::Static,
            static_grants: vec![StaticGrant {
                principal: "alice".to_string(),
                path: "/projects/alpha".to_string(),
                level: AccessLevel::Write,
            }],
            ..AuthorizationConfig::default()
        }
    }

    #[test]
    fn test_cache_config_mapping() {
        let config = AuthorizationConfig {
            permission_expiration_interval_s: 30,
            permission_forgetting_interval_s: 300,
            authority_timeout_ms: 250,
            ..AuthorizationConfig::default()
        };
        let cache = cache_config(&config);
        assert_eq!(cache.expiration_interval, Duration::from_secs(30));
        assert_eq!(cache.forgetting_interval, Duration::from_secs(300));
        assert_eq!(cache.authority_timeout, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_static_components_authorize_grants() {
        let components = AuthorizationComponents::from_config(&static_config()).unwrap();
        assert!(components.circuit_breaker.is_none());

        let alice = Principal::new("alice");
        let allowed = components
            .authorizer
            .authorize(&alice, "/projects/alpha/data.csv", AccessLevel::Write)
            .await
            .unwrap();
        assert!(allowed.decision.is_allowed());

        let denied = components
            .authorizer
            .authorize(&alice, "/projects/beta", AccessLevel::Read)
            .await
            .unwrap();
        assert!(!denied.decision.is_allowed());

        let stats = components.get_stats().await;
        assert_eq!(stats.authority.total_checks, 2);
        assert!(stats.circuit_breaker.is_none());
    }

    #[tokio::test]
    async fn test_http_components_carry_circuit_breaker() {
        let config = AuthorizationConfig {
            authority_endpoint: "http://127.0.0.1:1".to_string(),
            ..AuthorizationConfig::default()
        };
        let components = AuthorizationComponents::from_config(&config).unwrap();
        let stats = components.get_stats().await;
        assert!(stats.circuit_breaker.is_some());
    }

    #[test]
    fn test_invalid_grant_path_rejected() {
        let mut config = static_config();
        config.static_grants[0].path = "/projects/../alpha".to_string();
        assert!(matches!(
            AuthorizationComponents::from_config(&config),
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_background_tasks_started() {
        let components = AuthorizationComponents::from_config(&static_config()).unwrap();
        let (tx, rx) = mpsc::channel(4);
        let handles = components.start_background_tasks(Some(rx));
        assert_eq!(handles.len(), 2);

        drop(tx);
        for handle in handles {
            handle.abort();
        }
    }
}
