//! Operational HTTP surface: health checks and metrics

pub mod runtime;

pub use runtime::{create_router, start_server};

use std::sync::Arc;

use crate::auth::components::AuthorizationComponents;
use crate::gateway::StorageGateway;
use crate::health::HealthManager;
use crate::observability::MetricsManager;

/// Shared state for the operational routes
#[derive(Clone)]
pub struct AppState {
    pub health: HealthManager,
    pub authorization: AuthorizationComponents,
    pub gateway: StorageGateway,
    /// `None` when metrics are disabled
    pub metrics: Option<Arc<MetricsManager>>,
}
