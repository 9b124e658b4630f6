//! Test doubles
//!
//! Lets the engine be exercised end to end without a running MQTT broker.

pub mod mocks;

pub use mocks::{MockBroker, PublishedMessage};
