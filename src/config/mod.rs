pub mod models;
pub mod validation;

pub use models::*;
pub use validation::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::AccessLevel;
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };
    use garde::Validate;

    fn from_toml(toml: &str) -> AppConfig {
        Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(toml))
            .extract()
            .expect("Should parse config")
    }

    #[test]
    fn test_valid_config_loads() {
        let config = from_toml(
            r#"
            [server]
            port = 8080
            bind = "0.0.0.0"

            [logging]
            level = "info"
            format = "json"

            [authorization]
            authority_endpoint = "https://authority.internal"
            cluster_name = "prod-eu"
            permission_expiration_interval_s = 30
            permission_forgetting_interval_s = 300
        "#,
        );

        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.authorization.cluster_name, "prod-eu");
        assert_eq!(config.authorization.permission_forgetting_interval_s, 300);
        // Untouched fields keep their defaults
        assert_eq!(config.authorization.authority_timeout_ms, 5000);
    }

    #[test]
    fn test_default_values() {
        let config: AppConfig = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .extract()
            .expect("Should load defaults");

        assert!(config.validate().is_ok());
        assert_eq!(config.authorization.permission_expiration_interval_s, 60);
        assert_eq!(config.authorization.permission_forgetting_interval_s, 600);
        assert_eq!(config.storage.mode, StorageMode::Memory);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_invalid_port_rejected() {
        let config = from_toml(
            r#"
            [server]
            port = 80
        "#,
        );

        let validation = config.validate();
        assert!(validation.is_err());
        assert!(validation.unwrap_err().to_string().contains("port"));
    }

    #[test]
    fn test_validation_catches_invalid_bind() {
        let config = from_toml(
            r#"
            [server]
            port = 8080
            bind = "invalid-ip-address"
        "#,
        );

        let validation = config.validate();
        assert!(validation.is_err());
        assert!(validation.unwrap_err().to_string().contains("bind"));
    }

    #[test]
    fn test_forgetting_shorter_than_expiration_rejected() {
        let config = from_toml(
            r#"
            [authorization]
            permission_expiration_interval_s = 600
            permission_forgetting_interval_s = 60
        "#,
        );

        let validation = config.validate();
        assert!(validation.is_err());
        assert!(validation.unwrap_err().to_string().contains("permission_forgetting_interval_s"));
    }

    #[test]
    fn test_static_grants_and_mounts_parse() {
        let config = from_toml(
            r#"
            [authorization]
            authority_mode = "static"
            authority_endpoint = ""

            [[authorization.static_grants]]
            principal = "alice"
            path = "/org/proj"
            level = "write"

            [storage]
            mode = "memory"

            [[storage.mounts]]
            prefix = "/archive"
            mode = "local"
            base_path = "/var/lib/gateway/archive"
        "#,
        );

        assert!(config.validate().is_ok());
        assert_eq!(config.authorization.authority_mode, AuthorityMode::Static);
        assert_eq!(config.authorization.static_grants[0].level, AccessLevel::Write);
        assert_eq!(config.storage.mounts[0].mode, StorageMode::Local);
    }

    #[test]
    fn test_invalid_grant_path_and_missing_base_path_rejected() {
        let config = from_toml(
            r#"
            [authorization]
            authority_mode = "static"

            [[authorization.static_grants]]
            principal = "alice"
            path = "/org/../etc"
            level = "read"

            [storage]
            mode = "local"
        "#,
        );

        let report = config.validate().unwrap_err().to_string();
        assert!(report.contains("static_grants"));
        assert!(report.contains("base_path"));
    }

    #[test]
    fn test_http_mode_requires_endpoint() {
        let config = from_toml(
            r#"
            [authorization]
            authority_mode = "http"
            authority_endpoint = "authority.internal"
        "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_hierarchy() {
        unsafe {
            std::env::set_var("APP_SERVER__PORT", "3000");
        }

        let default = r#"[server]
        port = 8080"#;

        let env_specific = r#"[server]
        port = 9090"#;

        let config: AppConfig = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(default))
            .merge(Toml::string(env_specific))
            .merge(Env::prefixed("APP_").split("__"))
            .extract()
            .expect("Should merge configs");

        assert_eq!(config.server.port, 3000);

        unsafe {
            std::env::remove_var("APP_SERVER__PORT");
        }
    }

    #[test]
    fn test_cli_overrides_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            "[server]\nport = 8080\n[logging]\nlevel = \"warn\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("staging.toml"), "[server]\nshutdown_timeout = 45\n").unwrap();

        let cli = Cli {
            config_dir: dir.path().to_path_buf(),
            environment: Some("staging".to_string()),
            port: Some(8282),
            bind: Some("127.0.0.1".to_string()),
            debug: true,
            ..Cli::default()
        };
        let config: AppConfig = build_figment(&cli).extract().unwrap();

        assert_eq!(config.server.port, 8282);
        assert_eq!(config.server.shutdown_timeout, 45);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.environment, Environment::Staging);
    }
}
