//! Pure connection state management for the MQTT transport
//!
//! Connection state, reconnection backoff and `MqttOptions` construction.
//! Nothing in here performs I/O.

use super::health_monitor::HealthMonitor;
use crate::config::{ClientConfig, ConfigError, Scheme};
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection state for the MQTT transport
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state, first connection attempt in progress
    Connecting,
    /// ConnAck received, requests may be issued
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Reconnection attempts exhausted or the transport was shut down
    PermanentlyDisconnected(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Reconnection backoff, the `[reconnect]` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Sum of every delay when attempts are bounded
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Delay in milliseconds before `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.calculate_backoff_delay(attempt))
    }

    pub fn validate(&self) -> Result<(), String> {
        HealthMonitor::validate_connection_config(self)
    }
}

/// Build `MqttOptions` from validated client configuration
pub fn configure_mqtt_options(config: &ClientConfig) -> Result<MqttOptions, ConfigError> {
    let endpoint = config.broker.endpoint()?;
    let mut mqtt_options = MqttOptions::new(config.client_id(), endpoint.host, endpoint.port);

    if endpoint.scheme == Scheme::Tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // password without username is ignored, as brokers reject it
    if let Some(username) = config.broker.get_username() {
        let password = config.broker.get_password().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.broker.keep_alive_secs));
    mqtt_options.set_clean_start(true);
    mqtt_options.set_manual_acks(config.broker.manual_acks);
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    Ok(mqtt_options)
}
