//! CaseBridge Configuration System
//!
//! TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub legacy: LegacyApiConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,

    /// Data directory for local storage
    pub data_dir: String,

    /// Enable development mode
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            legacy: LegacyApiConfig::default(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            data_dir: "./data".to_string(),
            dev_mode: false,
        }
    }
}

/// Shadow store database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/casebridge.db".to_string(),
            max_connections: 10,
        }
    }
}

/// Legacy case-management API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyApiConfig {
    /// Vendor domain appended to bare office subdomains
    /// (`https://{subdomain}.{vendor_domain}/api/ajax`)
    pub vendor_domain: String,
    /// Locale sent with the auth request
    pub auth_locale: String,
    /// Aggregate outbound requests-per-second budget
    pub requests_per_second: f64,
    /// One token bucket per office instead of a single process-wide bucket
    pub per_office_rate_limit: bool,
    /// Retry attempts for rate-limited/transport failures
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Assumed server-side session lifetime. The legacy auth response does
    /// not report an expiry, so this is configurable rather than a verified
    /// protocol fact.
    pub token_lifetime_minutes: i64,
    /// Safety margin subtracted from the lifetime; a cached token is reused
    /// only while its expiry is more than this margin away.
    pub token_refresh_margin_minutes: i64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Safety valve: when set, every outbound legacy call fails fast with a
    /// clear error instead of executing.
    pub disabled: bool,
}

impl Default for LegacyApiConfig {
    fn default() -> Self {
        Self {
            vendor_domain: "casemanager.example.net".to_string(),
            auth_locale: "en-GB".to_string(),
            requests_per_second: 10.0,
            per_office_rate_limit: false,
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 30000,
            token_lifetime_minutes: 30,
            token_refresh_margin_minutes: 5,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            disabled: false,
        }
    }
}

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub queue_name: String,
    /// Seconds a polled job stays invisible before redelivery
    pub visibility_timeout_secs: u32,
    /// Delivery attempts before a job is dead-lettered
    pub max_attempts: u32,
    pub poll_batch: u32,
    pub poll_interval_ms: u64,
    /// Concurrent job handlers per worker process
    pub worker_concurrency: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "casebridge-jobs".to_string(),
            visibility_timeout_secs: 300,
            max_attempts: 5,
            poll_batch: 10,
            poll_interval_ms: 500,
            worker_concurrency: 4,
        }
    }
}

/// Recurring sync scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Incremental poll cadence (default: every 5 minutes)
    pub incremental_interval_secs: u64,
    /// Full re-sync cadence (default: daily)
    pub full_sync_interval_secs: u64,
    /// Stale reference-data cleanup cadence (default: daily)
    pub cleanup_interval_secs: u64,
    /// Reference rows not re-reported for this many days are pruned
    pub reference_stale_after_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            incremental_interval_secs: 300,
            full_sync_interval_secs: 86400,
            cleanup_interval_secs: 86400,
            reference_stale_after_days: 7,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.legacy.requests_per_second <= 0.0 {
            return Err(ConfigError::ValidationError(
                "legacy.requests_per_second must be positive".to_string(),
            ));
        }
        if self.legacy.token_refresh_margin_minutes >= self.legacy.token_lifetime_minutes {
            return Err(ConfigError::ValidationError(
                "legacy.token_refresh_margin_minutes must be less than token_lifetime_minutes"
                    .to_string(),
            ));
        }
        if self.legacy.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "legacy.max_retries must be at least 1".to_string(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "queue.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.queue.worker_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "queue.worker_concurrency must be at least 1".to_string(),
            ));
        }
        if self.legacy.vendor_domain.is_empty() {
            return Err(ConfigError::ValidationError(
                "legacy.vendor_domain must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# CaseBridge Configuration
# Environment variables (CASEBRIDGE_*) override these settings

[database]
url = "sqlite://./data/casebridge.db"
max_connections = 10

[legacy]
vendor_domain = "casemanager.example.net"
auth_locale = "en-GB"
requests_per_second = 10.0
per_office_rate_limit = false
max_retries = 3
backoff_base_ms = 1000
backoff_max_ms = 30000
token_lifetime_minutes = 30
token_refresh_margin_minutes = 5
connect_timeout_secs = 10
request_timeout_secs = 30
disabled = false

[queue]
queue_name = "casebridge-jobs"
visibility_timeout_secs = 300
max_attempts = 5
poll_batch = 10
poll_interval_ms = 500
worker_concurrency = 4

[scheduler]
enabled = true
incremental_interval_secs = 300
full_sync_interval_secs = 86400
cleanup_interval_secs = 86400
reference_stale_after_days = 7

data_dir = "./data"
dev_mode = false
"#
        .to_string()
    }
}
