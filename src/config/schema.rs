use crate::billing::catalog::{default_products, Product, ProductCatalog};
use crate::billing::UnknownProductPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level service configuration (`config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub billing: BillingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = directories::ProjectDirs::from("", "", "canvas-billing").map_or_else(
            || PathBuf::from("canvas.db"),
            |dirs| dirs.data_dir().join("canvas.db"),
        );
        Self { path }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Allow binding a non-loopback address without a reverse proxy.
    pub allow_public_bind: bool,
    /// Webhook requests per minute per client (0 = unlimited).
    pub webhook_rate_limit_per_minute: u32,
    /// Bearer token required by the dashboard API. Unset disables the check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            allow_public_bind: false,
            webhook_rate_limit_per_minute: 120,
            dashboard_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Polar webhook endpoint secret. Unset disables signature checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    pub unknown_product: UnknownProductPolicy,
    pub products: Vec<Product>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            unknown_product: UnknownProductPolicy::default(),
            products: default_products(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Reads `path` if given, otherwise the per-user config file if it
    /// exists, otherwise defaults. Environment overrides apply last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);

        let mut config = match path {
            Some(ref path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                let config = Self::from_toml_str(&raw)
                    .with_context(|| format!("Invalid config file {}", path.display()))?;
                tracing::debug!("Loaded config from {}", path.display());
                config
            }
            Some(ref path) => {
                tracing::debug!("No config file at {}, using defaults", path.display());
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `CANVAS_DATABASE_PATH`, `POLAR_WEBHOOK_SECRET` and
    /// `CANVAS_DASHBOARD_TOKEN` from `lookup`. Empty values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = var("CANVAS_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(secret) = var("POLAR_WEBHOOK_SECRET") {
            self.billing.webhook_secret = Some(secret);
        }
        if let Some(token) = var("CANVAS_DASHBOARD_TOKEN") {
            self.gateway.dashboard_token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            anyhow::bail!("gateway.port must be non-zero");
        }
        self.catalog().map(|_| ())
    }

    /// Product catalog built from `[[billing.products]]`.
    pub fn catalog(&self) -> Result<ProductCatalog> {
        ProductCatalog::new(self.billing.products.clone())
    }
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "canvas-billing")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
