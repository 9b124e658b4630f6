//! pubsub-mqtt
//!
//! Topic subscription, reconnection and bounded query engine over a single
//! MQTT broker connection.
//!
//! # Overview
//!
//! - Long-lived subscriptions: one broker subscription per topic, shared by
//!   every waiting caller, each message delivered to exactly one of them
//! - Callback subscriptions driven from the broker's delivery task
//! - Bounded queries: subscribe, collect up to N messages or T time, unsubscribe
//! - Transparent resubscription after every reconnect
//! - `rumqttc` v5 transport with backoff, TLS and manual acknowledgements
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pubsub_mqtt::{ClientConfig, PubSubClient, QueryOptions};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfig::from_toml_str("[broker]\nurl = \"mqtt://localhost:1883\"")?;
//! let client = PubSubClient::connect_mqtt(config).await?;
//!
//! let cancel = CancellationToken::new();
//! if let Some(envelope) = client.subscribe(&cancel, "orders/created").await? {
//!     println!("{}", envelope.payload_str());
//! }
//!
//! let readings = client
//!     .query(&cancel, "sensors/+/temp", QueryOptions::default().with_limit(5))
//!     .await?;
//! println!("{}", String::from_utf8_lossy(&readings));
//!
//! client.disconnect(Duration::from_secs(1)).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod health;
pub mod observability;
pub mod query;
pub mod reconnect;
pub mod registry;
pub mod testing;
pub mod transport;

pub use client::PubSubClient;
pub use config::{ClientConfig, ConfigError};
pub use envelope::{Committer, Envelope};
pub use error::{PubSubError, PubSubResult};
pub use health::{Health, HealthCheck, HealthStatus};
pub use query::QueryOptions;
pub use transport::mqtt::MqttTransport;
pub use transport::{BrokerTransport, QoS};
