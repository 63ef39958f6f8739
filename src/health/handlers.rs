use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use tracing::debug;

use super::HealthStatus;
use crate::server::AppState;

/// Liveness check at /health; the process is up
pub async fn liveness_handler() -> &'static str {
    "OK"
}

/// Readiness check at /health/ready
///
/// A degraded authority still reports ready: cached grants keep serving and
/// everything else fails closed. Starting is tolerated during the grace period.
pub async fn readiness_handler(State(state): State<AppState>) -> Response {
    debug!("Readiness check requested");

    let mut health = state.health.get_health(Some(&state.authorization)).await;
    health.services.insert(
        "storage".to_string(),
        super::ServiceHealth {
            status: HealthStatus::Healthy,
            message: format!("{} mount(s)", state.gateway.router().prefixes().len()),
            last_checked: chrono::Utc::now(),
        },
    );

    let status = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Starting if state.health.is_in_startup_period() => StatusCode::OK,
        HealthStatus::Starting | HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(health)).into_response()
}
