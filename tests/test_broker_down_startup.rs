//! Startup against a broker that refuses the first connections
//!
//! Construction must succeed; the client keeps retrying in the background
//! with the configured backoff until it connects, gives up or is shut down.

mod test_helpers;

use pubsub_mqtt::observability::NoopMetrics;
use pubsub_mqtt::testing::MockBroker;
use pubsub_mqtt::transport::BrokerTransport;
use pubsub_mqtt::PubSubClient;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::fast_config;
use tokio_util::sync::CancellationToken;

async fn wait_until<F: Fn() -> bool>(condition: F, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test]
async fn test_client_connects_after_initial_failures() {
    let broker = Arc::new(MockBroker::new());
    broker.fail_next_connects(3);

    let client = PubSubClient::connect(fast_config(), broker.clone(), Arc::new(NoopMetrics))
        .await
        .expect("construction succeeds while the broker is down");
    assert!(!client.is_connected());
    assert!(!client.health().await.is_up());

    assert!(wait_until(|| broker.is_connected(), Duration::from_secs(2)).await);
    assert_eq!(broker.connect_attempts(), 4);
    assert!(client.health().await.is_up());

    // once connected the client works normally
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.subscribe_with_function("t", |_| async { Ok(()) }).await.unwrap();
    assert_eq!(broker.subscribe_count("t"), 1);
}

#[tokio::test]
async fn test_bootstrap_respects_max_attempts() {
    let broker = Arc::new(MockBroker::new());
    broker.fail_next_connects(100);
    let mut config = fast_config();
    config.reconnect.max_attempts = Some(2);

    let _client = PubSubClient::connect(config, broker.clone(), Arc::new(NoopMetrics))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    // one initial attempt plus two retries
    assert_eq!(broker.connect_attempts(), 3);
    assert!(!broker.is_connected());
}

#[tokio::test]
async fn test_disconnect_stops_bootstrap_retries() {
    let broker = Arc::new(MockBroker::new());
    broker.fail_next_connects(u32::MAX);

    let client = PubSubClient::connect(fast_config(), broker.clone(), Arc::new(NoopMetrics))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.disconnect(Duration::ZERO).await.unwrap();
    let attempts = broker.connect_attempts();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.connect_attempts(), attempts);
}

#[tokio::test]
async fn test_subscribe_while_down_reports_not_connected() {
    let broker = Arc::new(MockBroker::new());
    broker.fail_next_connects(u32::MAX);
    let client = PubSubClient::connect(fast_config(), broker.clone(), Arc::new(NoopMetrics))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let err = client
        .subscribe(&CancellationToken::new(), "t")
        .await
        .unwrap_err();

    assert!(matches!(err, pubsub_mqtt::PubSubError::NotConnected));
    // fast_config waits 20 ms before reporting
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert!(client.subscribed_topics().await.is_empty());
}
