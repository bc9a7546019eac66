//! Application configuration.
//!
//! Aggregates the settings of every module into one [`Config`] loaded from
//! YAML files and environment variables. Durations are in milliseconds.

use serde::Deserialize;
use url::Url;

use crate::addressing::AddressingConfig;
use crate::dispatch::{OutboxDispatchOptions, ScheduledDispatchOptions};
use crate::resilience::TransportResilienceOptions;
use crate::storage::StorageConfig;
use crate::transport::settings::{ChannelSettings, TransportSettings};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable naming an extra configuration file.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Settings of the bus itself.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Address the bus publishes from and receives responses under.
    pub address: String,
    pub request_timeout_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            address: "channel://local/bus".to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

impl BusSettings {
    pub fn address(&self) -> Result<Url> {
        Url::parse(&self.address)
            .map_err(|e| ConfigError::Invalid(format!("bus address '{}': {e}", self.address)))
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_timeout_ms)
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusSettings,
    /// One entry per transport host, tagged by `kind`.
    pub transports: Vec<TransportSettings>,
    /// Host-level resilience defaults, applied to hosts without their own.
    pub resilience: TransportResilienceOptions,
    pub outbox: OutboxDispatchOptions,
    pub scheduler: ScheduledDispatchOptions,
    pub storage: StorageConfig,
    pub addressing: AddressingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusSettings::default(),
            transports: vec![TransportSettings::Channel(ChannelSettings::default())],
            resilience: TransportResilienceOptions::default(),
            outbox: OutboxDispatchOptions::default(),
            scheduler: ScheduledDispatchOptions::default(),
            storage: StorageConfig::default(),
            addressing: AddressingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `courier.yaml` in the working directory (if present)
    /// 2. the file named by `path` (if given)
    /// 3. the file named by `COURIER_CONFIG` (if set)
    /// 4. `COURIER__*` environment variables, `__` separating sections
    pub fn load(path: Option<&str>) -> Result<Self> {
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
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that can never work.
    pub fn validate(&self) -> Result<()> {
        self.bus.address()?;
        for transport in &self.transports {
            transport
                .address()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if self.outbox.batch_size == 0 || self.scheduler.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".to_string()));
        }
        if self.outbox.max_concurrent_destinations == 0 {
            return Err(ConfigError::Invalid(
                "outbox.max_concurrent_destinations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Transport settings with the host-level resilience defaults filled in.
    pub fn transport_settings(&self) -> Vec<TransportSettings> {
        self.transports
            .iter()
            .cloned()
            .map(|mut settings| {
                let resilience = match &mut settings {
                    TransportSettings::Channel(s) => &mut s.resilience,
                    TransportSettings::Amqp(s) => &mut s.resilience,
                    TransportSettings::Kafka(s) => &mut s.resilience,
                    TransportSettings::SnsSqs(s) => &mut s.resilience,
                    TransportSettings::Grpc(s) => &mut s.resilience,
                };
                resilience.get_or_insert_with(|| self.resilience.clone());
                settings
            })
            .collect()
    }
}
