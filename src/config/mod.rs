pub mod schema;

pub use schema::{BillingConfig, Config, DatabaseConfig, GatewayConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::UnknownProductPolicy;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 3000);
        assert!(!config.gateway.allow_public_bind);
        assert_eq!(config.billing.unknown_product, UnknownProductPolicy::Ignore);
        assert_eq!(config.billing.products.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [gateway]
            port = 8080

            [billing]
            unknown_product = "reject"
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.billing.unknown_product, UnknownProductPolicy::Reject);
        assert_eq!(config.billing.products.len(), 3);
    }

    #[test]
    fn products_can_be_overridden() {
        let config = Config::from_toml_str(
            r#"
            [[billing.products]]
            id = "prod_test"
            slug = "test"
            credits = 5
            "#,
        )
        .unwrap();
        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.credits_for("prod_test"), Some(5));
        assert_eq!(catalog.credits_for("1abe9287-6989-4203-a36d-0ac1b62caa50"), None);
    }

    #[test]
    fn duplicate_products_fail_validation() {
        let config = Config::from_toml_str(
            r#"
            [[billing.products]]
            id = "p"
            slug = "a"
            credits = 5

            [[billing.products]]
            id = "p"
            slug = "b"
            credits = 10
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_port_fails_validation() {
        let mut config = Config::default();
        config.gateway.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply_and_ignore_blanks() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CANVAS_DATABASE_PATH", "/tmp/canvas-test.db"),
            ("POLAR_WEBHOOK_SECRET", "whsec"),
            ("CANVAS_DASHBOARD_TOKEN", "  "),
        ]);
        let mut config = Config::default();
        config.apply_env_overrides(|key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.database.path, PathBuf::from("/tmp/canvas-test.db"));
        assert_eq!(config.billing.webhook_secret.as_deref(), Some("whsec"));
        assert!(config.gateway.dashboard_token.is_none());
    }

    #[test]
    fn load_reads_explicit_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[gateway]\nport = 4100\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.gateway.port, 4100);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(Some(&tmp.path().join("absent.toml"))).unwrap();
        assert_eq!(config.gateway.port, 3000);
    }

    #[test]
    fn load_rejects_malformed_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[gateway\nport = ").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let config = Config::default();
        let raw = toml::to_string(&config).unwrap();
        let parsed = Config::from_toml_str(&raw).unwrap();
        assert_eq!(parsed.billing.products, config.billing.products);
        assert_eq!(parsed.gateway.port, config.gateway.port);
    }
}
