use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Main configuration for the aggregator service
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// gRPC server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage backend configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Retention pruning configuration
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Health probe and monitor configuration
    #[serde(default)]
    pub health: HealthConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port, 0 disables the exporter
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// gRPC server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_server_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Upper bound on a single request's storage work, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How long in-flight requests may drain on shutdown, in seconds
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// Which storage engine backs the service
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Postgres,
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StorageBackend,
    /// PostgreSQL connection URL; takes precedence over discrete parameters
    pub url: Option<String>,
    /// Resolve connection settings from DATABASE_URL / POSTGRES_* variables
    #[serde(default)]
    pub use_env: bool,
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_db_name")]
    pub database: String,
    /// libpq sslmode (disable, allow, prefer, require, verify-ca, verify-full)
    #[serde(default = "default_sslmode")]
    pub sslmode: String,
    /// Connection pool sizing
    #[serde(default)]
    pub pool: PoolConfig,
    /// Entry ceiling for the memory backend (unbounded when unset)
    pub memory_capacity: Option<usize>,
}

/// Connection pool sizing. Fixed for the process lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of open connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Idle connections kept warm once the idle timeout reaps the rest
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: u32,
    /// Maximum lifetime of a connection in seconds
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Connect/acquire timeout in seconds, also bounds the startup ping
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Retention pruning configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Run the background pruner
    #[serde(default)]
    pub enabled: bool,
    /// Entries ingested longer ago than this are deleted, in seconds
    #[serde(default = "default_retention_max_age_secs")]
    pub max_age_secs: u64,
    /// Pause between pruning passes, in seconds
    #[serde(default = "default_retention_interval_secs")]
    pub interval_secs: u64,
}

/// Health probe configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /health and /ready over HTTP
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_host")]
    pub host: String,
    #[serde(default = "default_health_port")]
    pub port: u16,
    /// Interval of the background storage health monitor, in seconds
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "loghaven-aggregator".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    50051
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_db_name() -> String {
    "logs".to_string()
}

fn default_sslmode() -> String {
    "disable".to_string()
}

fn default_max_connections() -> u32 {
    25
}

fn default_max_idle_connections() -> u32 {
    5
}

fn default_max_lifetime_secs() -> u64 {
    300 // 5 minutes
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_retention_max_age_secs() -> u64 {
    7 * 24 * 3600 // 7 days
}

fn default_retention_interval_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_health_host() -> String {
    "0.0.0.0".to_string()
}

fn default_health_port() -> u16 {
    8080
}

fn default_monitor_interval_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/aggregator").required(false))
            .add_source(config::File::with_name("/etc/loghaven/aggregator").required(false))
            // Override with environment variables
            // AGGREGATOR__STORAGE__URL -> storage.url
            .add_source(
                config::Environment::with_prefix("AGGREGATOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        if config.storage.use_env {
            config.storage.apply_env(|key| std::env::var(key).ok());
        }
        config.validate()?;

        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::invalid("server.port", "must be non-zero"));
        }
        if self.server.request_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "server.request_timeout_secs",
                "must be non-zero",
            ));
        }

        let pool = &self.storage.pool;
        if pool.max_connections == 0 {
            return Err(ConfigError::invalid(
                "storage.pool.max_connections",
                "must be non-zero",
            ));
        }
        if pool.max_idle_connections > pool.max_connections {
            return Err(ConfigError::invalid(
                "storage.pool.max_idle_connections",
                format!(
                    "{} exceeds max_connections ({})",
                    pool.max_idle_connections, pool.max_connections
                ),
            ));
        }

        if self.retention.enabled {
            if self.retention.max_age_secs == 0 {
                return Err(ConfigError::invalid(
                    "retention.max_age_secs",
                    "must be non-zero when retention is enabled",
                ));
            }
            if self.retention.interval_secs == 0 {
                return Err(ConfigError::invalid(
                    "retention.interval_secs",
                    "must be non-zero when retention is enabled",
                ));
            }
        }

        if self.health.monitor_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "health.monitor_interval_secs",
                "must be non-zero",
            ));
        }

        Ok(())
    }

    /// Get per-request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }

    /// Get retention age as Duration
    pub fn retention_max_age(&self) -> Duration {
        Duration::from_secs(self.retention.max_age_secs)
    }

    /// Get retention interval as Duration
    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention.interval_secs)
    }

    /// Get health monitor interval as Duration
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.health.monitor_interval_secs)
    }
}

impl StorageConfig {
    /// Overlay connection settings from the conventional container variables.
    ///
    /// `DATABASE_URL` wins outright; otherwise each `POSTGRES_*` variable
    /// replaces its discrete setting when set and non-empty.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(url) = get("DATABASE_URL") {
            self.url = Some(url);
            return;
        }

        if let Some(host) = get("POSTGRES_HOST") {
            self.host = host;
        }
        if let Some(port) = get("POSTGRES_PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(user) = get("POSTGRES_USER") {
            self.user = user;
        }
        if let Some(password) = get("POSTGRES_PASSWORD") {
            self.password = password;
        }
        if let Some(database) = get("POSTGRES_DB") {
            self.database = database;
        }
        if let Some(sslmode) = get("POSTGRES_SSLMODE") {
            self.sslmode = sslmode;
        }
    }

    /// Resolve PostgreSQL connect options from the URL or discrete settings
    pub fn connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return PgConnectOptions::from_str(url)
                .map_err(|e| ConfigError::invalid("storage.url", e.to_string()));
        }

        let ssl_mode = PgSslMode::from_str(&self.sslmode)
            .map_err(|e| ConfigError::invalid("storage.sslmode", e.to_string()))?;

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database)
            .ssl_mode(ssl_mode);

        if !self.password.is_empty() {
            options = options.password(&self.password);
        }

        Ok(options)
    }
}

impl PoolConfig {
    /// Get max connection lifetime as Duration
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            request_timeout_secs: default_request_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            url: None,
            use_env: false,
            host: default_db_host(),
            port: default_db_port(),
            user: default_db_user(),
            password: String::new(),
            database: default_db_name(),
            sslmode: default_sslmode(),
            pool: PoolConfig::default(),
            memory_capacity: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_idle_connections: default_max_idle_connections(),
            max_lifetime_secs: default_max_lifetime_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_age_secs: default_retention_max_age_secs(),
            interval_secs: default_retention_interval_secs(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_health_host(),
            port: default_health_port(),
            monitor_interval_secs: default_monitor_interval_secs(),
        }
    }
}
