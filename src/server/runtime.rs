use anyhow::Result;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use std::future::IntoFuture;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::AppState;
use crate::auth::cache::Invalidation;
use crate::config::AppConfig;
use crate::health::{liveness_handler, readiness_handler};
use crate::middleware::{metrics_middleware, request_context_middleware};

/// Bind, serve the operational routes and shut down gracefully
///
/// Starts the permission cache sweeper and invalidation listener for the
/// lifetime of the server. On unix, SIGHUP drops every cached permission.
pub async fn start_server(config: AppConfig, state: AppState) -> Result<()> {
    let (invalidation_tx, invalidation_rx) = mpsc::channel(16);
    let background = state.authorization.start_background_tasks(Some(invalidation_rx));
    let reload = tokio::spawn(forward_reload_signal(invalidation_tx));

    let app = create_router(state.clone());

    let bind_addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}. Is another process using this port?", bind_addr, e))?;
    info!(address = %bind_addr, "Storage gateway listening");

    state.health.mark_ready().await;

    let (signal_tx, signal_rx) = oneshot::channel::<()>();
    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signal_tx.send(());
        })
        .into_future();

    let grace = Duration::from_secs(config.server.shutdown_timeout);
    tokio::select! {
        result = serve => result?,
        _ = async {
            if signal_rx.await.is_ok() {
                tokio::time::sleep(grace).await;
            } else {
                std::future::pending::<()>().await;
            }
        } => {
            warn!(timeout_s = grace.as_secs(), "Graceful shutdown timed out, dropping open connections");
        }
    }

    reload.abort();
    for handle in background {
        handle.abort();
    }

    info!("Server shutdown complete");
    Ok(())
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_context_middleware))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(manager) => (
            [("content-type", "text/plain; version=0.0.4")],
            manager.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "Metrics disabled").into_response(),
    }
}

#[cfg(unix)]
async fn forward_reload_signal(sender: mpsc::Sender<Invalidation>) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable, cache flush on reload disabled");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        info!("Received SIGHUP, dropping cached permissions");
        if sender.send(Invalidation::All).await.is_err() {
            break;
        }
    }
}

#[cfg(not(unix))]
async fn forward_reload_signal(_sender: mpsc::Sender<Invalidation>) {}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}
