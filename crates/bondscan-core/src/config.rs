/*!
 * Configuration management for bondscan.
 *
 * Settings are layered: built-in defaults, then an optional file, then
 * environment variables.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::UNKNOWN_DEVICE_LABEL;

/// Core configuration for bondscan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error, or a directive list)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to print the event target alongside each line
    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Label rendered for devices without an advertised name
    #[serde(default = "default_unknown_device_label")]
    pub unknown_device_label: String,

    /// How long a discovery session may run before it is cancelled
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Buffer size of the registry notification channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
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

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            unknown_device_label: default_unknown_device_label(),
            timeout_secs: default_timeout_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl DiscoveryConfig {
    /// Session timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check the values a session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(Error::config("discovery.timeout_secs must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(Error::config("discovery.event_capacity must be at least 1"));
        }
        Ok(())
    }
}

impl Config {
    /// Parse a configuration from an inline TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)
            .map_err(|e| Error::config(format!("Failed to parse TOML: {}", e)))?;
        config.discovery.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("Failed to render TOML: {}", e)))
    }
}

fn default_app_name() -> String {
    "bondscan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_with_target() -> bool {
    true
}

fn default_unknown_device_label() -> String {
    UNKNOWN_DEVICE_LABEL.to_string()
}

// Classic inquiry runs for roughly 12 seconds on most stacks.
fn default_timeout_secs() -> u64 {
    12
}

fn default_event_capacity() -> usize {
    100
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            return Ok(config);
        }

        let default_config = Config::default();
        let mut config_builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.discovery.validate()?;

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

impl AsRef<Config> for Config {
    fn as_ref(&self) -> &Config {
        self
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "bondscan");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.discovery.unknown_device_label, "Unknown Device");
        assert_eq!(config.discovery.timeout(), Duration::from_secs(12));
        assert_eq!(config.discovery.event_capacity, 100);
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "bondscan");
        assert_eq!(config.discovery.timeout_secs, 12);
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("bondscan.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [logging]
                level = "debug"

                [discovery]
                unknown_device_label = "Unnamed"
                timeout_secs = 30
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(file_path).build()?;

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.discovery.unknown_device_label, "Unnamed");
        assert_eq!(config.discovery.timeout_secs, 30);
        assert_eq!(config.discovery.event_capacity, 100);

        Ok(())
    }

    #[test]
    fn test_config_builder_missing_file() -> Result<()> {
        let config = ConfigBuilder::new()
            .with_config_file("/nonexistent/bondscan.toml")
            .build()?;
        assert_eq!(config.discovery.timeout_secs, 12);
        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("BONDSCANENVTEST__DISCOVERY__TIMEOUT_SECS", "5");
        env::set_var("BONDSCANENVTEST__LOGGING__LEVEL", "trace");

        let config = ConfigBuilder::new()
            .with_environment_prefix("BONDSCANENVTEST")
            .build()?;

        assert_eq!(config.discovery.timeout_secs, 5);
        assert_eq!(config.logging.level, "trace");

        env::remove_var("BONDSCANENVTEST__DISCOVERY__TIMEOUT_SECS");
        env::remove_var("BONDSCANENVTEST__LOGGING__LEVEL");

        Ok(())
    }

    #[test]
    fn test_zero_capacity_rejected() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("bondscan.toml");
        std::fs::write(&file_path, "[discovery]\nevent_capacity = 0\n")?;

        let err = ConfigBuilder::new()
            .with_config_file(file_path)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        Ok(())
    }

    #[test]
    fn test_zero_timeout_rejected() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("bondscan.toml");
        std::fs::write(&file_path, "[discovery]\ntimeout_secs = 0\n")?;

        let err = ConfigBuilder::new()
            .with_config_file(file_path)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Config::from_toml_str("[discovery]\ntimeout_secs = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        Ok(())
    }

    #[test]
    fn test_toml_round_trip_keeps_sections() -> Result<()> {
        let config = Config::from_toml_str("[discovery]\nunknown_device_label = \"?\"\n")?;
        assert_eq!(config.discovery.unknown_device_label, "?");
        assert_eq!(config.general.app_name, "bondscan");

        let rendered = config.to_toml_string()?;
        assert!(rendered.contains("[discovery]"));
        Ok(())
    }

    #[test]
    fn test_shared_config() {
        let shared = SharedConfig::new(Config::default());
        let shared2 = shared.clone();
        assert_eq!(shared2.get().general.app_name, "bondscan");
    }
}
