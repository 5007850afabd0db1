//! Runtime configuration.
//!
//! Loaded from YAML files and `COURIER__`-prefixed environment variables.

use serde::Deserialize;

use crate::bus::PubSubConfig;
use crate::state::DEFAULT_STREAM_BUFFER;
use crate::transport::TransportConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Inbound gRPC server.
    pub server: ServerConfig,
    /// The application this runtime serves.
    pub app: AppConfig,
    /// Pub/sub components, addressed by name.
    pub pubsubs: Vec<PubSubConfig>,
    /// Delivery tuning shared by all components.
    pub delivery: DeliveryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            app: AppConfig::default(),
            pubsubs: vec![PubSubConfig::default()],
            delivery: DeliveryConfig::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: TransportConfig,
}

/// Application callback configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Callback address: `host:port`, `http(s)://` URL, or UDS path.
    /// Without it only streaming subscriptions are available.
    pub address: Option<String>,
    /// Retry the initial connection with exponential backoff.
    pub connect_retry: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            address: None,
            connect_retry: true,
        }
    }
}

/// Delivery tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Frames buffered per attached stream.
    pub stream_buffer: usize,
    /// Overrides every component's per-message ack deadline when set.
    pub ack_deadline_ms: Option<u64>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            stream_buffer: DEFAULT_STREAM_BUFFER,
            ack_deadline_ms: None,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `courier.yaml` in current directory (if exists)
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

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = std::collections::HashSet::new();
        for pubsub in &self.pubsubs {
            if pubsub.name.is_empty() {
                return Err(ConfigError::Invalid(
                    "pub/sub component name must not be empty".to_string(),
                ));
            }
            if !names.insert(pubsub.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate pub/sub component name '{}'",
                    pubsub.name
                )));
            }
        }
        if self.delivery.stream_buffer == 0 {
            return Err(ConfigError::Invalid(
                "delivery.stream_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Component configurations with delivery-wide overrides applied.
    pub fn effective_pubsubs(&self) -> Vec<PubSubConfig> {
        self.pubsubs
            .iter()
            .cloned()
            .map(|mut pubsub| {
                if let Some(ack_deadline_ms) = self.delivery.ack_deadline_ms {
                    pubsub.channel.ack_deadline_ms = ack_deadline_ms;
                    pubsub.amqp.ack_deadline_ms = ack_deadline_ms;
                }
                pubsub
            })
            .collect()
    }
}
