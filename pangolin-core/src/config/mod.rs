//! Configuration management
//!
//! Environment-based configuration with defaults and validation, covering
//! the crypto layer, migration policy, and logging.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::core_migration::{MigrationConfig, Protocol};
use crate::logging::{LogConfig, LogLevel};

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Crypto layer configuration
    pub crypto: CryptoConfig,

    /// Migration policy applied until the server pushes one
    pub migration: MigrationSettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Crypto layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// How many prekeys to generate per replenishment batch
    pub prekey_batch_size: u16,

    /// How many key packages to keep published
    pub key_package_amount: usize,

    /// Timeout for distributing one commit bundle
    #[serde(with = "humantime_serde")]
    pub commit_distribution_timeout: Duration,
}

/// Migration policy defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSettings {
    /// Whether conversations migrate off Proteus
    pub enabled: bool,

    /// Protocol preferred for new conversations
    pub default_protocol: Protocol,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            crypto: CryptoConfig::default(),
            migration: MigrationSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            prekey_batch_size: 100,
            key_package_amount: 100,
            commit_distribution_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self { enabled: false, default_protocol: Protocol::Proteus }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json_format: false, with_target: true }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Variables follow the pattern `PANGOLIN_<SECTION>_<KEY>`, e.g.
    /// `PANGOLIN_CRYPTO_PREKEY_BATCH_SIZE=50`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(batch) = env::var("PANGOLIN_CRYPTO_PREKEY_BATCH_SIZE") {
            config.crypto.prekey_batch_size = batch.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid prekey batch size: {}", e))
            })?;
        }
        if let Ok(amount) = env::var("PANGOLIN_CRYPTO_KEY_PACKAGE_AMOUNT") {
            config.crypto.key_package_amount = amount.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid key package amount: {}", e))
            })?;
        }
        if let Ok(enabled) = env::var("PANGOLIN_MIGRATION_ENABLED") {
            config.migration.enabled = enabled.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid migration flag: {}", e))
            })?;
        }
        if let Ok(level) = env::var("PANGOLIN_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(json) = env::var("PANGOLIN_LOG_JSON") {
            config.logging.json_format = json
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid JSON flag: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.crypto.prekey_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "prekey_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.crypto.key_package_amount == 0 {
            return Err(ConfigError::ValidationFailed(
                "key_package_amount must be greater than 0".to_string(),
            ));
        }
        if LogLevel::from_str(&self.logging.level).is_none() {
            return Err(ConfigError::ValidationFailed(format!(
                "unknown log level: {}",
                self.logging.level
            )));
        }
        Ok(())
    }

    /// The migration policy expressed by this configuration
    pub fn migration_config(&self) -> MigrationConfig {
        MigrationConfig {
            migration_enabled: self.migration.enabled,
            default_protocol: self.migration.default_protocol,
        }
    }

    /// The logging subsystem configuration expressed by this configuration
    pub fn log_config(&self) -> LogConfig {
        LogConfig::new(LogLevel::from_str(&self.logging.level).unwrap_or_default())
            .with_target(self.logging.with_target)
            .json_format(self.logging.json_format)
    }
}
