//! Health reporting for the broker connection

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const BACKEND_NAME: &str = "MQTT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Up => write!(f, "UP"),
            HealthStatus::Down => write!(f, "DOWN"),
        }
    }
}

/// Health of one backend connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,
    pub backend: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl Health {
    pub fn up(host: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Up,
            backend: BACKEND_NAME.to_string(),
            host: host.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn down(host: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Down,
            ..Self::up(host)
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }
}

/// Anything that can report [`Health`]; must never panic
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health(&self) -> Health;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_serialization() {
        let health = Health::up("broker.local").with_detail("subscriptions", "2");
        let json = serde_json::to_value(&health).unwrap();

        assert_eq!(json["status"], "UP");
        assert_eq!(json["backend"], "MQTT");
        assert_eq!(json["host"], "broker.local");
        assert_eq!(json["details"]["subscriptions"], "2");
    }

    #[test]
    fn test_down_health_omits_empty_details() {
        let health = Health::down("broker.local");
        assert!(!health.is_up());
        assert_eq!(health.status.to_string(), "DOWN");

        let json = serde_json::to_string(&health).unwrap();
        assert!(!json.contains("details"));

        let parsed: Health = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, health);
    }
}
