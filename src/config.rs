use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use validator::Validate;

const DEFAULT_ENV: &str = "development";
const DEFAULT_LOG_LEVEL: &str = "info";
const CONFIG_DIR: &str = "config";

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_min_connections() -> u32 {
    1
}

fn default_stock_retry_limit() -> u32 {
    3
}

fn default_return_window_days() -> i64 {
    7
}

fn default_gateway_timeout_secs() -> u64 {
    10
}

fn default_gateway_retry_limit() -> u32 {
    2
}

fn default_gateway_retry_backoff_ms() -> u64 {
    250
}

/// Payment gateway connection settings.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct GatewayConfig {
    #[validate(url)]
    pub base_url: String,
    #[validate(length(min = 1, message = "Gateway API key must not be empty"))]
    pub api_key: String,
    /// Bounded timeout for each outbound call.
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for transport failures only; business rejections are terminal.
    #[serde(default = "default_gateway_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_gateway_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// Immutable application configuration, injected into the orchestrators at
/// construction time. Business logic performs no global config lookups.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// Create tables from entity definitions on startup (sqlite/dev only).
    #[serde(default)]
    pub auto_migrate: bool,

    /// Warehouse origin postal code used for shipping quotes.
    #[validate(length(min = 3, message = "Origin postal code is required"))]
    pub origin_zip: String,

    /// Bound on optimistic-concurrency retries in the stock ledger.
    #[serde(default = "default_stock_retry_limit")]
    pub stock_retry_limit: u32,

    /// Days after delivery during which a refund may still be requested.
    /// Orders with no recorded delivery date are treated as eligible.
    #[serde(default = "default_return_window_days")]
    pub return_window_days: i64,

    #[validate]
    pub gateway: GatewayConfig,
}

impl AppConfig {
    /// Loads configuration from `config/default.toml`, an optional
    /// per-environment file, and `STOREFRONT_*` environment variables, in
    /// ascending priority.
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            std::env::var("STOREFRONT_ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENV.to_string());

        let mut builder = Config::builder();

        let default_path = Path::new(CONFIG_DIR).join("default.toml");
        if default_path.exists() {
            builder = builder.add_source(File::from(default_path));
        }
        let env_path = Path::new(CONFIG_DIR).join(format!("{environment}.toml"));
        if env_path.exists() {
            builder = builder.add_source(File::from(env_path));
        }

        let config: AppConfig = builder
            .add_source(Environment::with_prefix("STOREFRONT").separator("__"))
            .build()?
            .try_deserialize()?;

        config
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;

        Ok(config)
    }

    /// Minimal configuration for tests and local tooling.
    pub fn for_tests(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            environment: "test".to_string(),
            log_level: "debug".to_string(),
            db_max_connections: 1,
            db_min_connections: 1,
            auto_migrate: true,
            origin_zip: "94105".to_string(),
            stock_retry_limit: default_stock_retry_limit(),
            return_window_days: default_return_window_days(),
            gateway: GatewayConfig {
                base_url: "http://localhost:9090".to_string(),
                api_key: "test_gateway_key".to_string(),
                timeout_secs: 1,
                retry_limit: 1,
                retry_backoff_ms: 10,
            },
        }
    }
}
