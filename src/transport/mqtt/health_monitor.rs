//! Pure reconnection and state transition logic for the MQTT transport

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::Duration;
use tracing::{error, info, warn};

/// Reconnection decisions and state transitions, free of I/O
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether another attempt should be made after
    /// `current_attempts` consecutive failures
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Upper bound for the initial connect, derived from the backoff budget
    pub fn calculate_connection_timeout(config: &ReconnectConfig, floor: Duration) -> Duration {
        match config.calculate_max_total_time() {
            Some(max_total_time) => floor.max(Duration::from_millis(max_total_time)),
            None => floor,
        }
    }

    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    pub fn can_issue_requests(state: &ConnectionState) -> bool {
        state.is_connected()
    }

    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempt, "MQTT reconnection successful");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "MQTT connection lost");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(attempt, "Starting reconnection attempt");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "MQTT connection permanently closed");
            }
            _ => {
                info!(from = ?from, to = ?to, "MQTT connection state changed");
            }
        }
    }

    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or unset for unlimited".to_string());
        }

        if config.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }

        if config.backoff_pattern.iter().any(|delay| *delay == 0) {
            return Err("backoff_pattern delays must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Outcome of [`HealthMonitor::should_attempt_reconnection`]
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig::default();

        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 25
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(5, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 6,
                delay_ms: 250
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, true),
            ReconnectionDecision::AbortShutdownRequested
        );

        let limited = ReconnectConfig {
            max_attempts: Some(5),
            ..Default::default()
        };
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(5, &limited, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_calculate_connection_timeout() {
        let floor = Duration::from_secs(5);
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&ReconnectConfig::default(), floor),
            floor
        );

        let slow = ReconnectConfig {
            max_attempts: Some(3),
            backoff_pattern: vec![4000, 4000],
            sustained_delay: 4000,
        };
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&slow, floor),
            Duration::from_millis(12_000)
        );
    }

    #[test]
    fn test_determine_next_state() {
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::DisconnectedByBroker),
            ConnectionState::Disconnected("Broker disconnected".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::NetworkError("eof".to_string())),
            ConnectionState::Disconnected("eof".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(2)),
            ConnectionState::Reconnecting(2)
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure(
                "gave up".to_string()
            )),
            ConnectionState::PermanentlyDisconnected("gave up".to_string())
        );
    }

    #[test]
    fn test_can_issue_requests() {
        assert!(HealthMonitor::can_issue_requests(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_issue_requests(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_issue_requests(&ConnectionState::Reconnecting(1)));
        assert!(!HealthMonitor::can_issue_requests(
            &ConnectionState::PermanentlyDisconnected("closed".to_string())
        ));
    }

    #[test]
    fn test_validate_connection_config() {
        assert!(HealthMonitor::validate_connection_config(&ReconnectConfig::default()).is_ok());

        let zero_attempts = ReconnectConfig {
            max_attempts: Some(0),
            ..Default::default()
        };
        assert!(HealthMonitor::validate_connection_config(&zero_attempts).is_err());

        let zero_sustained = ReconnectConfig {
            sustained_delay: 0,
            ..Default::default()
        };
        assert!(HealthMonitor::validate_connection_config(&zero_sustained).is_err());

        let zero_in_pattern = ReconnectConfig {
            backoff_pattern: vec![25, 0],
            ..Default::default()
        };
        assert!(HealthMonitor::validate_connection_config(&zero_in_pattern).is_err());
    }
}
