//! Health reporting through the client and the HTTP endpoint

mod test_helpers;

use pubsub_mqtt::observability::HealthServer;
use pubsub_mqtt::HealthStatus;
use test_helpers::connected_client;
use warp::http::StatusCode;

#[tokio::test]
async fn test_health_follows_connection_state() {
    let (client, broker, _) = connected_client().await;
    client
        .subscribe_with_function("status", |_| async { Ok(()) })
        .await
        .unwrap();

    let health = client.health().await;
    assert_eq!(health.status, HealthStatus::Up);
    assert_eq!(health.backend, "MQTT");
    assert_eq!(health.host, "mock-broker");
    assert_eq!(health.details["subscriptions"], "1");
    assert_eq!(health.details["state"], "Connected");

    broker.simulate_connection_lost("keep-alive timeout");
    let health = client.health().await;
    assert_eq!(health.status, HealthStatus::Down);
    // the subscription survives the outage
    assert_eq!(health.details["subscriptions"], "1");
}

#[tokio::test]
async fn test_health_endpoint_serves_client_status() {
    let (client, broker, _) = connected_client().await;
    let server = HealthServer::new(client.clone(), 0);
    let routes = server.routes();

    let response = warp::test::request().path("/health").reply(&routes).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["status"], "UP");
    assert_eq!(body["host"], "mock-broker");

    broker.set_connected(false);
    let response = warp::test::request().path("/health").reply(&routes).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["status"], "DOWN");
}
