//! Shared fixtures for integration tests

use pubsub_mqtt::config::ClientConfig;
use pubsub_mqtt::observability::metrics::CounterMetrics;
use pubsub_mqtt::testing::MockBroker;
use pubsub_mqtt::PubSubClient;
use std::sync::Arc;
use std::time::Duration;

/// Config with short engine timeouts so failure paths finish quickly
#[allow(dead_code)]
pub fn fast_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.broker.client_id = Some("integration-test".to_string());
    config.engine.not_connected_retry_ms = 20;
    config.engine.subscribe_timeout_ms = 500;
    config.engine.unsubscribe_timeout_ms = 200;
    config.reconnect.backoff_pattern = vec![5, 10];
    config.reconnect.sustained_delay = 10;
    config
}

/// Client connected to a fresh mock broker, with its own counters
#[allow(dead_code)]
pub async fn connected_client() -> (Arc<PubSubClient>, Arc<MockBroker>, Arc<CounterMetrics>) {
    let broker = Arc::new(MockBroker::new());
    let metrics = Arc::new(CounterMetrics::new());
    let client = PubSubClient::connect(fast_config(), broker.clone(), metrics.clone())
        .await
        .expect("mock broker accepts the connection");
    // let the post-connect resubscription pass finish before tests count calls
    settle().await;
    (Arc::new(client), broker, metrics)
}

/// Let spawned waiters reach their receive point
#[allow(dead_code)]
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}
