//! Configuration for the simulator, loadable from YAML.
//!
//! Every section has defaults, so an empty file (or no file) yields a
//! working local setup: registry at `localhost:8080`, broker at
//! `localhost:1883`.

use crate::sensor::SensorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete simulator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device registry settings
    pub registry: RegistryConfig,
    /// MQTT broker settings
    pub broker: BrokerConfig,
    /// Reconciliation loop settings
    pub orchestrator: OrchestratorConfig,
    /// Publish cadence per sensor kind
    pub publish: PublishConfig,
    /// HTTP telemetry injection settings
    pub inject: InjectConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Device registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Device list endpoint
    pub url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/api/devices".to_string(),
            timeout_secs: 5,
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,
    /// Maximum wait for CONNACK in seconds
    pub connect_timeout_secs: u64,
    /// Maximum wait for PUBACK in seconds
    pub ack_timeout_secs: u64,
    /// Prepended to worker client ids so they never collide with real devices
    pub client_id_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_secs: 60,
            connect_timeout_secs: 5,
            ack_timeout_secs: 10,
            client_id_prefix: "sim_".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

/// Reconciliation loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Registry poll period in seconds
    pub poll_interval_secs: u64,
    /// Delay between worker starts within one cycle, in milliseconds
    pub stagger_ms: u64,
    /// Maximum wait for a stopped worker to finish, in seconds
    pub stop_timeout_secs: u64,
    /// First topic segment
    pub topic_prefix: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            stagger_ms: 200,
            stop_timeout_secs: 15,
            topic_prefix: "campus".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Publish cadence per sensor kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Interval overrides in seconds, keyed by sensor kind (aliases accepted).
    /// Kinds without an entry use their built-in interval.
    pub intervals: BTreeMap<String, u64>,
}

impl PublishConfig {
    /// Publish interval for `kind`.
    pub fn interval_for(&self, kind: SensorKind) -> Duration {
        self.intervals
            .iter()
            .find(|(name, _)| name.parse::<SensorKind>().ok() == Some(kind))
            .map(|(_, secs)| Duration::from_secs(*secs))
            .unwrap_or_else(|| kind.default_interval())
    }
}

/// HTTP telemetry injection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectConfig {
    /// Telemetry ingestion endpoint
    pub telemetry_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Number of retry attempts for failed posts
    pub max_retries: u32,
    /// Base delay between retries in milliseconds (exponential backoff)
    pub retry_delay_ms: u64,
    /// Pause between successive posts in milliseconds
    pub pacing_ms: u64,
    /// Period of live posts in follow mode, in seconds
    pub follow_interval_secs: u64,
}

impl Default for InjectConfig {
    fn default() -> Self {
        Self {
            telemetry_url: "http://localhost:8080/api/telemetry".to_string(),
            timeout_secs: 10,
            max_retries: 3,
            retry_delay_ms: 100,
            pacing_ms: 100,
            follow_interval_secs: 30,
        }
    }
}

impl InjectConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn follow_interval(&self) -> Duration {
        Duration::from_secs(self.follow_interval_secs)
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Include target in logs
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_target: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to `()`, not to a mapping.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write default config to a file
    pub fn write_default(path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(&Self::default())?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.url.trim().is_empty() {
            return Err(ConfigError::Invalid("registry.url is empty".to_string()));
        }
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.host is empty".to_string()));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Invalid("broker.port must be non-zero".to_string()));
        }
        if self.broker.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "broker.connect_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.broker.ack_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "broker.ack_timeout_secs must be at least 1".to_string(),
            ));
        }
        // rumqttc rejects client ids that are empty or start with whitespace.
        let prefix = &self.broker.client_id_prefix;
        if prefix.is_empty() || prefix.starts_with(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!(
                "broker.client_id_prefix '{}' must be non-empty and not start with whitespace",
                prefix
            )));
        }
        if self.orchestrator.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.orchestrator.topic_prefix.contains(&['+', '#'][..]) {
            return Err(ConfigError::Invalid(format!(
                "orchestrator.topic_prefix '{}' contains MQTT wildcards",
                self.orchestrator.topic_prefix
            )));
        }

        for (name, secs) in &self.publish.intervals {
            if name.parse::<SensorKind>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "publish.intervals has unknown sensor kind '{}'",
                    name
                )));
            }
            if *secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "publish.intervals.{} must be at least 1 second",
                    name
                )));
            }
        }

        // Sessions are only polled while publishing, so a publish must land
        // inside every keep-alive window or the broker drops the client.
        if self.broker.keep_alive_secs > 0 {
            for kind in SensorKind::all() {
                let interval = self.publish.interval_for(*kind);
                if interval >= self.broker.keep_alive() {
                    return Err(ConfigError::Invalid(format!(
                        "{} publish interval {:?} must be shorter than broker.keep_alive_secs ({})",
                        kind, interval, self.broker.keep_alive_secs
                    )));
                }
            }
        }

        if self.inject.follow_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "inject.follow_interval_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
