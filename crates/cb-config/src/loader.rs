//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "casebridge.toml",
    "./config/config.toml",
    "./config/casebridge.toml",
    "/etc/casebridge/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        // Start with defaults
        let mut config = AppConfig::default();

        // Try to load from file
        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config);

        config.validate()?;
        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        // Check explicit path first
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        // Check CASEBRIDGE_CONFIG env var
        if let Ok(path) = env::var("CASEBRIDGE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // Search standard paths
        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Database
        if let Ok(val) = env::var("CASEBRIDGE_DATABASE_URL") {
            config.database.url = val;
        }
        if let Ok(val) = env::var("CASEBRIDGE_DATABASE_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                config.database.max_connections = n;
            }
        }

        // Legacy API
        if let Ok(val) = env::var("CASEBRIDGE_LEGACY_VENDOR_DOMAIN") {
            config.legacy.vendor_domain = val;
        }
        if let Ok(val) = env::var("CASEBRIDGE_LEGACY_RPS") {
            if let Ok(rps) = val.parse() {
                config.legacy.requests_per_second = rps;
            }
        }
        if let Ok(val) = env::var("CASEBRIDGE_LEGACY_MAX_RETRIES") {
            if let Ok(n) = val.parse() {
                config.legacy.max_retries = n;
            }
        }
        if let Ok(val) = env::var("CASEBRIDGE_LEGACY_TOKEN_LIFETIME_MINUTES") {
            if let Ok(n) = val.parse() {
                config.legacy.token_lifetime_minutes = n;
            }
        }
        // Safety valve: any truthy value disables all outbound legacy calls
        if let Ok(val) = env::var("CASEBRIDGE_LEGACY_DISABLED") {
            config.legacy.disabled = matches!(val.as_str(), "1" | "true" | "TRUE" | "yes");
        }

        // Queue
        if let Ok(val) = env::var("CASEBRIDGE_QUEUE_NAME") {
            config.queue.queue_name = val;
        }
        if let Ok(val) = env::var("CASEBRIDGE_QUEUE_MAX_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                config.queue.max_attempts = n;
            }
        }
        if let Ok(val) = env::var("CASEBRIDGE_QUEUE_WORKER_CONCURRENCY") {
            if let Ok(n) = val.parse() {
                config.queue.worker_concurrency = n;
            }
        }

        // Scheduler
        if let Ok(val) = env::var("CASEBRIDGE_SCHEDULER_ENABLED") {
            config.scheduler.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("CASEBRIDGE_SCHEDULER_INCREMENTAL_SECS") {
            if let Ok(n) = val.parse() {
                config.scheduler.incremental_interval_secs = n;
            }
        }

        // General
        if let Ok(val) = env::var("CASEBRIDGE_DATA_DIR") {
            config.data_dir = val;
        }
        if let Ok(val) = env::var("CASEBRIDGE_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
