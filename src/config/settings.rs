use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::retry::rules::RetryRule;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub relations: RelationsConfig,
    #[serde(default)]
    pub renewal: RenewalConfig,
    #[serde(default)]
    pub early_renewal: EarlyRenewalConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/subscriptions.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Records kept in the per-entity metadata store.
    Meta,
    /// Records kept in a dedicated indexed table.
    Table,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::Table
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub store: StoreBackend,
    pub max_attempts: u32,
    /// Empty means the built-in rule table.
    pub rules: Vec<RetryRule>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store: StoreBackend::Table,
            max_attempts: 5,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationsConfig {
    #[serde(default)]
    pub store: StoreBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalConfig {
    pub accept_manual_renewals: bool,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            accept_manual_renewals: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyRenewalConfig {
    pub enabled: bool,
    pub token_ttl_secs: i64,
}

impl Default for EarlyRenewalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_ttl_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub batch_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self { batch_size: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            batch_size: 25,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let _ = dotenvy::dotenv();

        let config_path = Self::find_config_file()?;
        let config_content = std::fs::read_to_string(&config_path)?;
        let mut settings = Self::from_toml_str(&config_content)?;

        if let Ok(path) = std::env::var("SUBSCRIPTIONS_DATABASE_PATH") {
            if !path.trim().is_empty() {
                settings.database.path = path;
            }
        }

        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let settings: Settings = toml::from_str(content)?;
        if settings.retry.max_attempts == 0 && settings.retry.enabled {
            return Err("retry.max_attempts must be positive when retries are enabled".into());
        }
        Ok(settings)
    }

    fn find_config_file() -> Result<String, Box<dyn std::error::Error>> {
        let possible_names = ["custom-config.toml", "config.toml"];

        for name in &possible_names {
            if Path::new(name).exists() {
                return Ok(name.to_string());
            }
        }

        Err("Configuration file not found. Please create custom-config.toml or config.toml".into())
    }
}
