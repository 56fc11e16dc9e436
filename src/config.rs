use serde::Deserialize;
use std::fs;
use thiserror::Error;

use crate::accrual::AccrualConfig;
use crate::db::{DatabaseConfig, StorageRetryConfig};
use crate::reconcile::ReconcilerConfig;

/// Environment variables that override the YAML file
pub const ENV_DATABASE_URI: &str = "DATABASE_URI";
pub const ENV_ACCRUAL_ADDRESS: &str = "ACCRUAL_SYSTEM_ADDRESS";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    /// `hourly`, `daily`, anything else never rotates
    pub rotation: String,
    pub database: DatabaseConfig,
    pub accrual: AccrualConfig,
    pub reconciler: ReconcilerConfig,
    pub storage_retry: StorageRetryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "reconciler.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            database: DatabaseConfig::default(),
            accrual: AccrualConfig::default(),
            reconciler: ReconcilerConfig::default(),
            storage_retry: StorageRetryConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load `config/{env}.yaml`, then apply environment overrides
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        let mut config = Self::from_yaml(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Non-empty values returned by `lookup` replace the file settings
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_DATABASE_URI) {
            self.database.url = url;
        }
        if let Some(address) = get(ENV_ACCRUAL_ADDRESS) {
            self.accrual.base_url = address;
        }
        if let Some(level) = get(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
    }
}
