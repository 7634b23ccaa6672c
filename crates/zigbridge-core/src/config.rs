/*!
 * Configuration management for ZigBridge.
 *
 * This module loads layered settings (defaults, an optional file, then
 * environment variables) for the bridge and its ambient services.
 */
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Environment variable prefix used by [`ConfigBuilder::with_default_environment`]
pub const ENV_PREFIX: &str = "ZIGBRIDGE";

/// Core configuration for ZigBridge
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Coordinator bridge configuration
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application data directory; the persistent store and the coordinator
    /// database live underneath it
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether log lines include the emitting target
    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

/// Coordinator bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Length of the join window opened by `permitJoin`, in seconds
    #[serde(default = "default_permit_join_secs")]
    pub permit_join_secs: u64,

    /// File name of the coordinator database inside `<data_dir>/zigbee`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Fixed machine identifier for the bridge registry key; generated and
    /// persisted on first start when absent
    #[serde(default)]
    pub machine_id: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: default_with_target(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            permit_join_secs: default_permit_join_secs(),
            database_file: default_database_file(),
            machine_id: None,
        }
    }
}

impl GeneralConfig {
    /// The data directory as a path
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }
}

impl BridgeConfig {
    /// The join window as a duration
    pub fn permit_join_duration(&self) -> Duration {
        Duration::from_secs(self.permit_join_secs)
    }
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_with_target() -> bool {
    true
}

fn default_permit_join_secs() -> u64 {
    60
}

fn default_database_file() -> String {
    "dev.db".to_string()
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<PathBuf>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Read overrides from `ZIGBRIDGE__SECTION__KEY` variables
    pub fn with_default_environment(self) -> Self {
        self.with_environment_prefix(ENV_PREFIX)
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let defaults = ConfigLib::try_from(&Config::default())
            .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?;
        let mut builder = ConfigLib::builder().add_source(defaults);

        if let Some(path) = self.config_file {
            if path.exists() {
                debug!("Loading configuration from {}", path.display());
                builder = builder.add_source(File::from(path));
            } else {
                debug!(
                    "Configuration file {} does not exist, using defaults",
                    path.display()
                );
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            builder = builder.add_source(
                Environment::with_prefix(&prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
