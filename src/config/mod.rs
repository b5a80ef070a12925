//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.
//!
//! Keys are accepted in snake_case and in the camelCase of existing
//! deployment files (`listenAPI`, `redisStorage.afterTransferTTL`). The
//! `config` crate may fold file keys to lowercase, so each camelCase key is
//! also accepted in its lowercase form.

mod options;
mod server;
mod storage;

pub use options::OptionsConfig;
pub use server::{BatcherEndpoint, ChannelConfig, ListenApiConfig};
pub use storage::RedisStorageConfig;

use std::collections::HashSet;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CHANNEL_TRANSFER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CHANNEL_TRANSFER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CHANNEL_TRANSFER_LOG";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    #[default]
    Console,
    Json,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default log filter when `LOG_ENV_VAR` is unset.
    #[serde(alias = "logLevel", alias = "loglevel")]
    pub log_level: String,
    /// Log output format.
    #[serde(alias = "logType", alias = "logtype")]
    pub log_type: LogType,
    /// gRPC API listener.
    #[serde(alias = "listenAPI", alias = "listenapi")]
    pub listen_api: ListenApiConfig,
    /// Pipeline tuning.
    pub options: OptionsConfig,
    /// Destination channels and their batchers.
    pub channels: Vec<ChannelConfig>,
    /// Durable storage.
    #[serde(alias = "redisStorage", alias = "redisstorage")]
    pub redis_storage: RedisStorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_type: LogType::Console,
            listen_api: ListenApiConfig::default(),
            options: OptionsConfig::default(),
            channels: Vec::new(),
            redis_storage: RedisStorageConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let options = &self.options;
        if options.retry_execute_attempts == 0 {
            return Err(ConfigError::Invalid(
                "options.retry_execute_attempts must be at least 1".to_string(),
            ));
        }
        if options.retry_execute_delay > options.retry_execute_max_delay {
            return Err(ConfigError::Invalid(
                "options.retry_execute_delay exceeds options.retry_execute_max_delay".to_string(),
            ));
        }
        for (name, value) in [
            ("collectors_buf_size", options.collectors_buf_size),
            (
                "transfers_in_handle_on_channel",
                options.transfers_in_handle_on_channel,
            ),
            (
                "newest_request_stream_buffer_size",
                options.newest_request_stream_buffer_size,
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "options.{} must be at least 1",
                    name
                )));
            }
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.name.trim().is_empty() {
                return Err(ConfigError::Invalid("channel name is empty".to_string()));
            }
            if !seen.insert(channel.name.to_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "channel '{}' configured twice",
                    channel.name
                )));
            }
        }
        Ok(())
    }

    /// Names of all configured destination channels, lowercased.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.to_lowercase()).collect()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
