use anyhow::{Context, Result};
use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use garde::Validate;
use std::path::PathBuf;

use super::AppConfig;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "storage-gateway", about = "Permission-checked storage gateway")]
pub struct Cli {
    /// Path to an additional configuration file
    #[arg(long, env = "APP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding default.toml and {environment}.toml
    #[arg(long, default_value = "config")]
    pub config_dir: PathBuf,

    /// Server port
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long)]
    pub bind: Option<String>,

    /// Environment name
    #[arg(long, env = "ENVIRONMENT")]
    pub environment: Option<String>,

    /// Log level filter, e.g. "debug" or "storage_gateway=trace"
    #[arg(long)]
    pub log_level: Option<String>,

    /// Shorthand for --log-level debug
    #[arg(long)]
    pub debug: bool,
}

/// Load configuration, lowest priority first:
/// defaults, `default.toml`, `{environment}.toml`, an explicit `--config`
/// file, `APP_` environment variables, then CLI flags.
pub fn load_config(cli: &Cli) -> Result<AppConfig> {
    let config = build_figment(cli)
        .extract::<AppConfig>()
        .context("Failed to load configuration")?;

    config
        .validate()
        .map_err(|report| anyhow::anyhow!("Invalid configuration: {}", report))?;

    Ok(config)
}

pub fn build_figment(cli: &Cli) -> Figment {
    let env_name = cli
        .environment
        .clone()
        .or_else(|| std::env::var("ENVIRONMENT").ok())
        .unwrap_or_else(|| "production".to_string())
        .to_lowercase();

    let mut figment = Figment::new()
        .merge(Serialized::defaults(AppConfig::default()))
        .merge(Toml::file(cli.config_dir.join("default.toml")))
        .merge(Toml::file(cli.config_dir.join(format!("{}.toml", env_name))));

    if let Some(path) = &cli.config {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("APP_").split("__"));

    if let Some(port) = cli.port {
        figment = figment.merge(Serialized::default("server.port", port));
    }
    if let Some(bind) = &cli.bind {
        figment = figment.merge(Serialized::default("server.bind", bind));
    }
    if let Some(environment) = environment_variant(&env_name) {
        figment = figment.merge(Serialized::default("environment", environment));
    }
    if let Some(level) = &cli.log_level {
        figment = figment.merge(Serialized::default("logging.level", level));
    } else if cli.debug {
        figment = figment.merge(Serialized::default("logging.level", "debug"));
    }

    figment
}

fn environment_variant(name: &str) -> Option<&'static str> {
    match name {
        "development" | "dev" => Some("Development"),
        "staging" => Some("Staging"),
        "production" | "prod" => Some("Production"),
        _ => None,
    }
}
