//! `rumqttc` v5 transport
//!
//! Pure logic and I/O are kept apart:
//!
//! - [`connection`] - connection state, backoff and `MqttOptions`
//! - [`message_handler`] - event routing, topic filters, ack correlation
//! - [`health_monitor`] - reconnection decisions and state transitions
//! - [`client`] - the supervisor task and [`MqttTransport`]
//!
//! ```rust,no_run
//! use pubsub_mqtt::config::ClientConfig;
//! use pubsub_mqtt::transport::{mqtt::MqttTransport, BrokerTransport};
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfig::from_toml_str("[broker]\nurl = \"mqtt://localhost:1883\"")?;
//! let transport = MqttTransport::new(&config)?;
//! transport.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{MqttTransport, PublishAck};
pub use connection::{configure_mqtt_options, ConnectionState, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{topic_matches, EventRoute, HandlerRouter};
