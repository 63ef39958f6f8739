use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::auth::path::NormalizedPath;
use crate::auth::types::AccessLevel;

#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
pub struct AppConfig {
    #[garde(dive)]
    #[serde(default)]
    pub server: ServerConfig,

    #[garde(dive)]
    #[serde(default)]
    pub logging: LoggingConfig,

    #[garde(dive)]
    #[serde(default)]
    pub authorization: AuthorizationConfig,

    #[garde(dive)]
    #[serde(default)]
    pub storage: StorageConfig,

    #[garde(skip)]
    #[serde(default)]
    pub metrics: MetricsConfig,

    #[garde(skip)]
    #[serde(default)]
    pub environment: Environment,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[garde(range(min = 1024, max = 65535))]
    pub port: u16,

    #[garde(length(min = 1), custom(validate_bind_address))]
    #[serde(default = "default_bind")]
    pub bind: String,

    #[garde(range(min = 1, max = 300))]
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64, // seconds
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: default_bind(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoggingConfig {
    #[garde(length(min = 1))]
    #[serde(default = "default_log_level")]
    pub level: String, // trace, debug, info, warn, error

    #[garde(pattern(r"^(json|pretty)$"))]
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthorityMode {
    #[default]
    Http,
    /// Grants come from `static_grants`; for single-node and test deployments
    Static,
}

/// One grant served by the static authority
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Validate)]
pub struct StaticGrant {
    #[garde(length(min = 1))]
    pub principal: String,

    #[garde(custom(validate_cluster_path))]
    pub path: String,

    #[garde(skip)]
    pub level: AccessLevel,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct AuthorizationConfig {
    #[garde(skip)]
    pub authority_mode: AuthorityMode,

    #[garde(custom(require_endpoint_for_http(&self.authority_mode)))]
    pub authority_endpoint: String,

    /// Bearer token presented to the authority
    #[garde(skip)]
    pub authority_token: Option<String>,

    #[garde(length(min = 1))]
    pub cluster_name: String,

    #[garde(range(max = 86400))]
    pub permission_expiration_interval_s: u64,

    #[garde(custom(not_shorter_than(&self.permission_expiration_interval_s)))]
    pub permission_forgetting_interval_s: u64,

    #[garde(range(min = 1, max = 60000))]
    pub authority_timeout_ms: u64,

    #[garde(range(max = 3600000))]
    pub refresh_retry_backoff_ms: u64,

    #[garde(range(min = 1))]
    pub cache_max_entries: usize,

    #[garde(range(min = 1, max = 86400))]
    pub cache_sweep_interval_s: u64,

    #[garde(range(min = 1, max = 100))]
    pub circuit_breaker_failure_threshold: u32,

    #[garde(range(min = 1, max = 100))]
    pub circuit_breaker_success_threshold: u32,

    #[garde(range(min = 1, max = 3600))]
    pub circuit_breaker_retry_timeout_s: u64,

    /// Extra attempts after a transport failure
    #[garde(range(max = 10))]
    pub retry_max_attempts: u32,

    #[garde(dive)]
    pub static_grants: Vec<StaticGrant>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            authority_mode: AuthorityMode::Http,
            authority_endpoint: "http://localhost:8081".to_string(),
            authority_token: None,
            cluster_name: "default".to_string(),
            permission_expiration_interval_s: 60,
            permission_forgetting_interval_s: 600,
            authority_timeout_ms: 5000,
            refresh_retry_backoff_ms: 5000,
            cache_max_entries: 100_000,
            cache_sweep_interval_s: 60,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_success_threshold: 2,
            circuit_breaker_retry_timeout_s: 30,
            retry_max_attempts: 2,
            static_grants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    #[default]
    Memory,
    Local,
}

/// A backend mounted under a path prefix
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Validate)]
pub struct MountConfig {
    #[garde(custom(validate_cluster_path))]
    pub prefix: String,

    #[garde(skip)]
    #[serde(default)]
    pub mode: StorageMode,

    #[garde(custom(require_base_path_for_local(&self.mode)))]
    #[serde(default)]
    pub base_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend serving `/`
    #[garde(skip)]
    pub mode: StorageMode,

    #[garde(custom(require_base_path_for_local(&self.mode)))]
    pub base_path: String,

    #[garde(dive)]
    pub mounts: Vec<MountConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
pub enum Environment {
    Development,
    Staging,
    #[default]
    Production,
}

fn validate_bind_address(value: &str, _: &()) -> garde::Result {
    value
        .parse::<std::net::IpAddr>()
        .map(|_| ())
        .map_err(|_| garde::Error::new("Invalid IP address"))
}

fn validate_cluster_path(value: &str, _: &()) -> garde::Result {
    NormalizedPath::parse(value)
        .map(|_| ())
        .map_err(|e| garde::Error::new(format!("Invalid path: {}", e)))
}

fn not_shorter_than(expiration: &u64) -> impl FnOnce(&u64, &()) -> garde::Result + '_ {
    move |forgetting, _| {
        if forgetting < expiration {
            return Err(garde::Error::new(format!(
                "must be at least the expiration interval ({}s)",
                expiration
            )));
        }
        Ok(())
    }
}

fn require_endpoint_for_http(mode: &AuthorityMode) -> impl FnOnce(&String, &()) -> garde::Result + '_ {
    move |endpoint, _| {
        if *mode == AuthorityMode::Http && !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(garde::Error::new("http authority mode requires an http(s) endpoint"));
        }
        Ok(())
    }
}

fn require_base_path_for_local(mode: &StorageMode) -> impl FnOnce(&String, &()) -> garde::Result + '_ {
    move |base_path, _| {
        if *mode == StorageMode::Local && base_path.trim().is_empty() {
            return Err(garde::Error::new("local storage requires a base_path"));
        }
        Ok(())
    }
}
