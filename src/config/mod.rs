//! Application configuration.
//!
//! Aggregates messaging and dispatch settings into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;

pub use messaging::{AmqpSettings, MessagingConfig, MessagingType};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "rabbitbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RABBITBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RABBITBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RABBITBUS_LOG";

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Messaging (transport) configuration.
    pub messaging: MessagingConfig,
    /// Delivery dispatch configuration.
    pub dispatch: DispatchConfig,
}

/// How the dispatcher treats handler failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Keep running the remaining handlers of a delivery after one fails.
    ///
    /// Off by default: the first failure ends the fan-out for that message.
    /// Either way the failure is logged and the message counts as consumed.
    pub continue_on_handler_error: bool,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `rabbitbus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Create config for testing: in-memory channel transport.
    pub fn for_test() -> Self {
        Self {
            messaging: MessagingConfig {
                messaging_type: MessagingType::Channel,
                ..Default::default()
            },
            dispatch: DispatchConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serial_test::serial;

    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.messaging.messaging_type, MessagingType::Amqp);
        assert_eq!(config.messaging.amqp.url, "amqp://localhost:5672");
        assert!(!config.dispatch.continue_on_handler_error);
    }

    #[test]
    fn test_config_for_test() {
        let config = Config::for_test();
        assert_eq!(config.messaging.messaging_type, MessagingType::Channel);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "messaging:\n  type: channel\n  amqp:\n    url: amqp://broker:5672\n    connect_timeout_ms: 250\ndispatch:\n  continue_on_handler_error: true"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.messaging.messaging_type, MessagingType::Channel);
        assert_eq!(config.messaging.amqp.url, "amqp://broker:5672");
        assert_eq!(config.messaging.amqp.connect_timeout_ms, 250);
        assert_eq!(config.messaging.amqp.pool_size, 10);
        assert!(config.dispatch.continue_on_handler_error);
    }

    #[test]
    #[serial]
    fn test_load_env_overrides() {
        std::env::set_var("RABBITBUS__MESSAGING__AMQP__URL", "amqp://env-host:5672");
        let config = Config::load(None);
        std::env::remove_var("RABBITBUS__MESSAGING__AMQP__URL");

        assert_eq!(config.unwrap().messaging.amqp.url, "amqp://env-host:5672");
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file_fails() {
        assert!(Config::load(Some("/nonexistent/rabbitbus-config.yaml")).is_err());
    }
}
