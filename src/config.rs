//! Client configuration loaded from TOML
//!
//! Three sections drive the engine: `[broker]` (where and how to connect),
//! `[engine]` (queue depths and timeouts) and `[reconnect]` (backoff pattern).
//! Every field has a default so an empty file yields a client pointed at the
//! public default broker.

use crate::transport::mqtt::ReconnectConfig;
use crate::transport::QoS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Public broker used when no host is configured
pub const DEFAULT_BROKER_HOST: &str = "broker.hivemq.com";
pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_PROTOCOL: &str = "tcp";
/// Largest accepted `engine.channel_capacity`
pub const MAX_CHANNEL_CAPACITY: usize = 1 << 20;

/// Complete client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Full broker URL; when present it overrides protocol, host and port
    pub url: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Client identifier; generated when unset
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Hand acknowledgement to the caller through `Envelope::commit`
    #[serde(default)]
    pub manual_acks: bool,
}

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSection {
    /// Depth of every per-topic delivery queue
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    #[serde(default = "default_unsubscribe_timeout_ms")]
    pub unsubscribe_timeout_ms: u64,
    /// Pause applied before reporting "not connected" from `subscribe`
    #[serde(default = "default_not_connected_retry_ms")]
    pub not_connected_retry_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_query_limit")]
    pub query_limit: usize,
    /// How long a single connect attempt waits for ConnAck
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    10
}

fn default_subscribe_timeout_ms() -> u64 {
    5000
}

fn default_unsubscribe_timeout_ms() -> u64 {
    2000
}

fn default_not_connected_retry_ms() -> u64 {
    10_000
}

fn default_query_timeout_ms() -> u64 {
    5000
}

fn default_query_limit() -> usize {
    10
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: None,
            protocol: default_protocol(),
            host: None,
            port: None,
            client_id: None,
            username_env: None,
            password_env: None,
            qos: default_qos(),
            retain: false,
            keep_alive_secs: default_keep_alive(),
            manual_acks: false,
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            unsubscribe_timeout_ms: default_unsubscribe_timeout_ms(),
            not_connected_retry_ms: default_not_connected_retry_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            query_limit: default_query_limit(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl EngineSection {
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn unsubscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.unsubscribe_timeout_ms)
    }

    pub fn not_connected_retry(&self) -> Duration {
        Duration::from_millis(self.not_connected_retry_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Transport security resolved from the configured protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
}

/// Where to dial, after defaults and URL overrides are applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl BrokerSection {
    /// Resolve the endpoint: explicit URL first, then protocol/host/port,
    /// then the public default broker when no host is set.
    pub fn endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        if let Some(raw) = &self.url {
            let url = Url::parse(raw).map_err(|_| ConfigError::InvalidBrokerUrl(raw.clone()))?;
            let scheme = parse_scheme(url.scheme())?;
            let host = url
                .host_str()
                .ok_or_else(|| ConfigError::InvalidBrokerUrl(raw.clone()))?
                .to_string();
            let port = url.port().unwrap_or(match scheme {
                Scheme::Tls => 8883,
                Scheme::Tcp => 1883,
            });
            return Ok(BrokerEndpoint { scheme, host, port });
        }

        match &self.host {
            None => Ok(BrokerEndpoint {
                scheme: Scheme::Tcp,
                host: DEFAULT_BROKER_HOST.to_string(),
                port: DEFAULT_BROKER_PORT,
            }),
            Some(host) if host.trim().is_empty() => {
                Err(ConfigError::MissingField("broker.host".to_string()))
            }
            Some(host) => {
                let scheme = parse_scheme(&self.protocol)?;
                let port = self
                    .port
                    .ok_or_else(|| ConfigError::MissingField("broker.port".to_string()))?;
                Ok(BrokerEndpoint {
                    scheme,
                    host: host.clone(),
                    port,
                })
            }
        }
    }

    /// Configured QoS as the protocol type
    pub fn qos_level(&self) -> Result<QoS, ConfigError> {
        match self.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ConfigError::InvalidConfig(format!(
                "qos must be 0, 1 or 2, got {other}"
            ))),
        }
    }

    pub fn get_username(&self) -> Option<String> {
        get_env_var_optional(self.username_env.as_ref())
    }

    pub fn get_password(&self) -> Option<String> {
        get_env_var_optional(self.password_env.as_ref())
    }
}

fn parse_scheme(protocol: &str) -> Result<Scheme, ConfigError> {
    match protocol.to_lowercase().as_str() {
        "tcp" | "mqtt" => Ok(Scheme::Tcp),
        "ssl" | "tls" | "mqtts" => Ok(Scheme::Tls),
        other => Err(ConfigError::UnsupportedProtocol(other.to_string())),
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: ClientConfig = toml::from_str(content)?;
        config.prepare()?;
        Ok(config)
    }

    /// Validate every section and fill in the generated client id
    pub fn prepare(&mut self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.broker.client_id.as_deref().map_or(true, str::is_empty) {
            self.broker.client_id = Some(generate_client_id());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.endpoint()?;
        self.broker.qos_level()?;

        if self.broker.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be at least 5".to_string(),
            ));
        }
        if self.engine.channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.engine.channel_capacity > MAX_CHANNEL_CAPACITY {
            return Err(ConfigError::InvalidConfig(format!(
                "channel_capacity must be at most {MAX_CHANNEL_CAPACITY}"
            )));
        }
        if self.engine.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        self.reconnect
            .validate()
            .map_err(ConfigError::InvalidConfig)?;

        Ok(())
    }

    /// Client id, generating one if `prepare` was never called
    pub fn client_id(&self) -> String {
        self.broker
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_client_id)
    }
}

fn generate_client_id() -> String {
    format!("pubsub-{}", Uuid::new_v4().simple())
}
