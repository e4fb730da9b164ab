//! Configuration Module
//!
//! Provides TOML-based configuration for mqttlink with support for:
//! - Broker address, credentials and MQTT session parameters
//! - TLS settings
//! - Inbound and outbound topics
//! - Queue capacities and reconnect delays
//! - Sensor device settings
//! - Environment variable overrides (MQTTLINK__* prefix)

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::bridge::{DEFAULT_QUEUE_CAPACITY, MAX_PAYLOAD_LEN, MAX_TOPIC_LEN};
use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::protocol::{ProtocolVersion, QoS};
use crate::session::{SessionOptions, DEFAULT_MAX_HANDLERS};
use crate::supervisor::SupervisorConfig;
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::{SecurityOptions, TlsVersion};


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config or certificate file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub broker: BrokerConfig,
    pub tls: TlsConfig,
    pub topics: TopicsConfig,
    pub session: SessionConfig,
    pub bridge: BridgeConfig,
    pub supervisor: ReconnectConfig,
    pub sensor: SensorConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Broker connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keepalive in seconds, 0 disables it
    pub keep_alive: u16,
    pub clean_session: bool,
    /// 3 for MQTT v3.1, 4 for v3.1.1
    pub protocol_version: u8,
    /// Bound on CONNACK/SUBACK waits and writes (e.g., "5s")
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Bound on TCP connect and TLS handshake
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "mqttlink".to_string(),
            username: None,
            password: None,
            keep_alive: 30,
            clean_session: true,
            protocol_version: 4,
            command_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// TLS settings
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// "tls12" or "tls13"
    pub min_version: TlsVersion,
    /// PEM file with the CA certificate(s) that sign the broker certificate
    pub ca_cert: Option<PathBuf>,
    /// Name to verify the broker certificate against, defaults to the host
    pub server_name: Option<String>,
}

/// Topics used by the bridge
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// Filter subscribed on every connect; deliveries go to the inbound queue
    pub subscribe: String,
    /// Topic sensor frames are published to
    pub publish: String,
    pub qos: u8,
    pub retain: bool,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            subscribe: "mico/test/send".to_string(),
            publish: "mico/test/send".to_string(),
            qos: 0,
            retain: false,
        }
    }
}

/// Session engine settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_handlers: usize,
    pub max_packet_size: usize,
    /// Upper bound on one event loop wait (e.g., "5000ms")
    #[serde(with = "humantime_serde")]
    pub yield_interval: Duration,
    /// Extra PINGREQs sent before a silent broker is declared dead
    pub keepalive_retries: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_handlers: DEFAULT_MAX_HANDLERS,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            yield_interval: Duration::from_millis(5000),
            keepalive_retries: 0,
        }
    }
}

/// Queue capacities
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Reconnect delays
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(with = "humantime_serde")]
    pub connect_retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            connect_retry_delay: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Sensor device settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Serial device path, or "-" for line-oriented frames on stdin
    pub device: String,
    /// Send the poll command to the device periodically
    pub poll_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl SensorConfig {
    pub fn is_stdin(&self) -> bool {
        self.device == "-"
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            device: "-".to_string(),
            poll_enabled: true,
            poll_interval: Duration::from_secs(20),
        }
    }
}

/// Smallest packet limit that still fits every bridged message
const MIN_PACKET_SIZE: usize = MAX_TOPIC_LEN + MAX_PAYLOAD_LEN + 16;

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQTTLINK__` prefix with double underscores for nesting:
    ///    - `MQTTLINK__BROKER__HOST=broker.local` overrides `broker.host`
    ///    - `MQTTLINK__BROKER__KEEP_ALIVE=60` overrides `broker.keep_alive`
    ///    - `MQTTLINK__TLS__ENABLED=true` overrides `tls.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("broker.host", "localhost")?
            .set_default("broker.port", 1883)?
            .set_default("broker.client_id", "mqttlink")?
            .set_default("broker.keep_alive", 30)?
            .set_default("broker.clean_session", true)?
            .set_default("broker.protocol_version", 4)?
            .set_default("broker.command_timeout", "5s")?
            .set_default("broker.connect_timeout", "10s")?
            .set_default("tls.enabled", false)?
            .set_default("tls.min_version", "tls12")?
            .set_default("topics.subscribe", "mico/test/send")?
            .set_default("topics.publish", "mico/test/send")?
            .set_default("topics.qos", 0)?
            .set_default("topics.retain", false)?
            .set_default("session.max_handlers", DEFAULT_MAX_HANDLERS as u64)?
            .set_default("session.max_packet_size", DEFAULT_MAX_PACKET_SIZE as u64)?
            .set_default("session.yield_interval", "5000ms")?
            .set_default("session.keepalive_retries", 0)?
            .set_default("bridge.inbound_capacity", DEFAULT_QUEUE_CAPACITY as u64)?
            .set_default("bridge.outbound_capacity", DEFAULT_QUEUE_CAPACITY as u64)?
            .set_default("supervisor.connect_retry_delay", "3s")?
            .set_default("supervisor.reconnect_delay", "5s")?
            .set_default("sensor.device", "-")?
            .set_default("sensor.poll_enabled", true)?
            .set_default("sensor.poll_interval", "20s")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("MQTTLINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::Validation("broker.host cannot be empty".to_string()));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Validation("broker.port cannot be 0".to_string()));
        }

        let version = ProtocolVersion::from_u8(self.broker.protocol_version).ok_or_else(|| {
            ConfigError::Validation(format!(
                "broker.protocol_version must be 3 or 4, got {}",
                self.broker.protocol_version
            ))
        })?;
        if self.broker.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "broker.client_id cannot be empty".to_string(),
            ));
        }
        if version == ProtocolVersion::V31 && self.broker.client_id.len() > 23 {
            return Err(ConfigError::Validation(
                "broker.client_id must be at most 23 bytes for MQTT v3.1".to_string(),
            ));
        }
        if self.broker.password.is_some() && self.broker.username.is_none() {
            return Err(ConfigError::Validation(
                "broker.password requires broker.username".to_string(),
            ));
        }
        if self.broker.command_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "broker.command_timeout must be positive".to_string(),
            ));
        }

        if self.tls.enabled && self.tls.ca_cert.is_none() {
            return Err(ConfigError::Validation(
                "tls.ca_cert is required when tls.enabled is true".to_string(),
            ));
        }

        if QoS::from_u8(self.topics.qos).is_none() {
            return Err(ConfigError::Validation(
                "topics.qos must be 0, 1, or 2".to_string(),
            ));
        }
        validate_topic_filter(&self.topics.subscribe).map_err(|e| {
            ConfigError::Validation(format!("topics.subscribe '{}': {}", self.topics.subscribe, e))
        })?;
        validate_topic_name(&self.topics.publish).map_err(|e| {
            ConfigError::Validation(format!("topics.publish '{}': {}", self.topics.publish, e))
        })?;
        if self.topics.publish.len() > MAX_TOPIC_LEN {
            return Err(ConfigError::Validation(format!(
                "topics.publish exceeds {} bytes",
                MAX_TOPIC_LEN
            )));
        }

        if self.session.max_handlers == 0 {
            return Err(ConfigError::Validation(
                "session.max_handlers must be at least 1".to_string(),
            ));
        }
        if self.session.max_packet_size < MIN_PACKET_SIZE {
            return Err(ConfigError::Validation(format!(
                "session.max_packet_size must be at least {}",
                MIN_PACKET_SIZE
            )));
        }
        if self.session.yield_interval.is_zero() {
            return Err(ConfigError::Validation(
                "session.yield_interval must be positive".to_string(),
            ));
        }

        if self.bridge.inbound_capacity == 0 || self.bridge.outbound_capacity == 0 {
            return Err(ConfigError::Validation(
                "bridge queue capacities must be at least 1".to_string(),
            ));
        }

        if self.sensor.device.is_empty() {
            return Err(ConfigError::Validation("sensor.device cannot be empty".to_string()));
        }
        if self.sensor.poll_enabled && self.sensor.poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "sensor.poll_interval must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// QoS for both the subscription and published frames
    pub fn qos(&self) -> QoS {
        QoS::from_u8(self.topics.qos).unwrap_or_default()
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            client_id: self.broker.client_id.clone(),
            protocol_version: ProtocolVersion::from_u8(self.broker.protocol_version)
                .unwrap_or_default(),
            keep_alive: self.broker.keep_alive,
            clean_session: self.broker.clean_session,
            username: self.broker.username.clone(),
            password: self.broker.password.clone().map(Bytes::from),
            will: None,
            command_timeout: self.broker.command_timeout,
            max_handlers: self.session.max_handlers,
            max_packet_size: self.session.max_packet_size,
            keepalive_retries: self.session.keepalive_retries,
        }
    }

    /// Transport security, reading the CA file when TLS is on
    pub fn security_options(&self) -> Result<SecurityOptions, ConfigError> {
        if !self.tls.enabled {
            return Ok(SecurityOptions::plain());
        }
        let path = self.tls.ca_cert.as_ref().ok_or_else(|| {
            ConfigError::Validation("tls.ca_cert is required when tls.enabled is true".to_string())
        })?;
        let mut security = SecurityOptions::tls(std::fs::read(path)?, self.tls.min_version);
        security.server_name = self.tls.server_name.clone();
        Ok(security)
    }

    pub fn supervisor_config(&self) -> Result<SupervisorConfig, ConfigError> {
        Ok(SupervisorConfig {
            host: self.broker.host.clone(),
            port: self.broker.port,
            security: self.security_options()?,
            connect_timeout: self.broker.connect_timeout,
            session: self.session_options(),
            subscribe_topic: self.topics.subscribe.clone(),
            subscribe_qos: self.qos(),
            yield_interval: self.session.yield_interval,
            connect_retry_delay: self.supervisor.connect_retry_delay,
            reconnect_delay: self.supervisor.reconnect_delay,
        })
    }
}
