//! Prometheus metrics recorder
//!
//! Installs the global `metrics` recorder once at startup. The server renders
//! the handle on `/metrics`; nothing else listens on a separate port.

use anyhow::{Result, anyhow};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::sync::{Arc, OnceLock};

use crate::config::Environment;

/// Global metrics manager with Prometheus integration
pub struct MetricsManager {
    handle: PrometheusHandle,
    environment: String,
}

fn environment_label(environment: Environment) -> &'static str {
    match environment {
        Environment::Development => "development",
        Environment::Staging => "staging",
        Environment::Production => "production",
    }
}

/// Recorder carrying the service-level labels, not yet installed
pub fn build_recorder(environment: Environment) -> PrometheusRecorder {
    PrometheusBuilder::new()
        .add_global_label("service", "storage-gateway")
        .add_global_label("environment", environment_label(environment))
        .add_global_label("version", env!("CARGO_PKG_VERSION"))
        .build_recorder()
}

impl MetricsManager {
    /// Install the Prometheus recorder process-wide
    pub fn install(environment: Environment) -> Result<Self> {
        let recorder = build_recorder(environment);
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| anyhow!("Failed to install Prometheus recorder: {}", e))?;

        tracing::info!(environment = environment_label(environment), "Prometheus metrics recorder installed");

        Ok(Self {
            handle,
            environment: environment_label(environment).to_string(),
        })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }
}

static METRICS_MANAGER: OnceLock<Arc<MetricsManager>> = OnceLock::new();

/// Initialize the global metrics manager; a second call returns the first instance
pub fn init_metrics(environment: Environment) -> Result<Arc<MetricsManager>> {
    if let Some(existing) = METRICS_MANAGER.get() {
        return Ok(existing.clone());
    }
    let manager = Arc::new(MetricsManager::install(environment)?);
    Ok(METRICS_MANAGER.get_or_init(|| manager).clone())
}

pub fn get_metrics_manager() -> Result<Arc<MetricsManager>> {
    METRICS_MANAGER
        .get()
        .cloned()
        .ok_or_else(|| anyhow!("Metrics manager not initialized. Call init_metrics() first."))
}
