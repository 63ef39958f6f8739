pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod observability;
pub mod server;
pub mod services;

#[cfg(test)]
pub mod tests;

#[cfg(feature = "benchmarks")]
pub mod benchmarks;

pub use config::*;
pub use error::*;

use anyhow::Result;
use std::panic;

use crate::auth::components::AuthorizationComponents;
use crate::gateway::StorageGateway;
use crate::health::HealthManager;
use crate::server::AppState;
use crate::services::storage::BackendRouter;

/// Main server entry point for library usage
pub async fn run_server(cli: Cli) -> Result<()> {
    let app_config = config::load_config(&cli)?;

    logging::init_logging(&app_config.logging)?;

    panic::set_hook(Box::new(|panic_info| {
        ::tracing::error!(?panic_info, "FATAL: Panic occurred");
        std::process::exit(1);
    }));

    ::tracing::info!(environment = ?app_config.environment, "Storage gateway starting up");

    let metrics = if app_config.metrics.enabled {
        Some(observability::init_metrics(app_config.environment)?)
    } else {
        None
    };

    let authorization = AuthorizationComponents::from_config(&app_config.authorization)?;
    let router = BackendRouter::from_config(&app_config.storage)?;
    let gateway = StorageGateway::new(authorization.authorizer.clone(), router);

    let state = AppState {
        health: HealthManager::new(),
        authorization,
        gateway,
        metrics,
    };

    server::start_server(app_config, state).await
}
