use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::auth::components::{AuthorizationComponents, AuthorizationStats};
use crate::middleware::circuit_breaker::CircuitState;

/// Health status for individual services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Operational with reduced capability, e.g. serving from cache only
    Degraded,
    Unhealthy,
    Starting,
}

impl HealthStatus {
    /// Lower is worse
    fn priority(self) -> u8 {
        match self {
            HealthStatus::Unhealthy => 0,
            HealthStatus::Starting => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Healthy => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub message: String,
    pub last_checked: DateTime<Utc>,
}

impl ServiceHealth {
    fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            last_checked: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Worst of all services
    pub status: HealthStatus,
    pub services: HashMap<String, ServiceHealth>,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationStats>,
}

#[derive(Debug, Clone)]
struct CachedCheck {
    health: ServiceHealth,
    checked_at: Instant,
}

/// Tracks service health and checks the permission authority
///
/// Authority check results are cached for `check_ttl` so frequent readiness checks
/// do not add load to the authority.
#[derive(Debug, Clone)]
pub struct HealthManager {
    services: Arc<RwLock<HashMap<String, ServiceHealth>>>,
    authority_check: Arc<RwLock<Option<CachedCheck>>>,
    startup_time: Instant,
    startup_grace_period: Duration,
    check_ttl: Duration,
    check_timeout: Duration,
}

impl HealthManager {
    pub fn new() -> Self {
        let mut services = HashMap::new();
        services.insert(
            "api".to_string(),
            ServiceHealth::new(HealthStatus::Starting, "API server starting up"),
        );

        Self {
            services: Arc::new(RwLock::new(services)),
            authority_check: Arc::new(RwLock::new(None)),
            startup_time: Instant::now(),
            startup_grace_period: Duration::from_secs(30),
            check_ttl: Duration::from_secs(5),
            check_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_check_ttl(mut self, check_ttl: Duration) -> Self {
        self.check_ttl = check_ttl;
        self
    }

    /// Called once the listener is bound
    pub async fn mark_ready(&self) {
        self.update_service_health("api", HealthStatus::Healthy, "API server is ready")
            .await;
        info!("API service marked as ready");
    }

    pub async fn update_service_health(&self, service_name: &str, status: HealthStatus, message: impl Into<String>) {
        self.services
            .write()
            .await
            .insert(service_name.to_string(), ServiceHealth::new(status, message));
    }

    pub fn is_in_startup_period(&self) -> bool {
        self.startup_time.elapsed() < self.startup_grace_period
    }

    /// An unreachable authority only degrades the gateway: cached grants keep
    /// serving until they are forgotten and everything else fails closed.
    async fn check_authority(&self, components: &AuthorizationComponents) -> ServiceHealth {
        if let Some(cached) = self.authority_check.read().await.as_ref() {
            if cached.checked_at.elapsed() < self.check_ttl {
                return cached.health.clone();
            }
        }

        let breaker_open = match &components.circuit_breaker {
            Some(breaker) => breaker.state().await == CircuitState::Open,
            None => false,
        };

        let health = if breaker_open {
            ServiceHealth::new(HealthStatus::Degraded, "Circuit breaker open, serving cached permissions only")
        } else {
            match tokio::time::timeout(self.check_timeout, components.authority.health_check()).await {
                Ok(Ok(true)) => ServiceHealth::new(HealthStatus::Healthy, "Permission authority reachable"),
                Ok(Ok(false)) => ServiceHealth::new(HealthStatus::Degraded, "Permission authority reports unhealthy"),
                Ok(Err(e)) => {
                    warn!(error = %e, "Permission authority health check failed");
                    ServiceHealth::new(HealthStatus::Degraded, format!("Permission authority unavailable: {}", e.kind()))
                }
                Err(_) => ServiceHealth::new(HealthStatus::Degraded, "Permission authority health check timed out"),
            }
        };

        *self.authority_check.write().await = Some(CachedCheck {
            health: health.clone(),
            checked_at: Instant::now(),
        });
        health
    }

    pub async fn get_health(&self, components: Option<&AuthorizationComponents>) -> HealthResponse {
        let mut services = self.services.read().await.clone();
        let mut authorization = None;

        if let Some(components) = components {
            services.insert("authority".to_string(), self.check_authority(components).await);
            authorization = Some(components.get_stats().await);
        }

        let status = services
            .values()
            .map(|s| s.status)
            .min_by_key(|s| s.priority())
            .unwrap_or(HealthStatus::Healthy);

        HealthResponse {
            status,
            services,
            timestamp: Utc::now(),
            uptime_seconds: self.startup_time.elapsed().as_secs(),
            authorization,
        }
    }
}

impl Default for HealthManager {
    fn default() -> Self {
        Self::new()
    }
}
