//! Long-lived subscription behavior against the in-memory broker
//!
//! Covers single broker subscription under concurrency, fan-out semantics,
//! cancellation and unsubscribe wake-ups.

mod test_helpers;

use futures::future::join_all;
use pubsub_mqtt::handler::CallbackResult;
use pubsub_mqtt::PubSubError;
use std::collections::HashSet;
use std::time::Duration;
use test_helpers::{connected_client, settle};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_concurrent_subscribers_share_one_broker_subscription() {
    let (client, broker, _) = connected_client().await;
    let cancel = CancellationToken::new();

    let mut waiters = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        let cancel = cancel.clone();
        waiters.push(tokio::spawn(async move {
            client.subscribe(&cancel, "orders").await
        }));
    }
    settle().await;

    assert_eq!(broker.subscribe_count("orders"), 1);
    assert_eq!(client.subscribed_topics().await, vec!["orders".to_string()]);

    for i in 0..8 {
        assert_eq!(broker.deliver("orders", format!("order-{i}")), 1);
    }

    let results = timeout(Duration::from_secs(1), join_all(waiters))
        .await
        .expect("every waiter gets a message");
    let received: HashSet<String> = results
        .into_iter()
        .map(|joined| {
            let envelope = joined.unwrap().unwrap().expect("not cancelled");
            envelope.payload_str().to_string()
        })
        .collect();

    let expected: HashSet<String> = (0..8).map(|i| format!("order-{i}")).collect();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_one_message_reaches_exactly_one_waiter() {
    let (client, broker, _) = connected_client().await;
    let first_cancel = CancellationToken::new();
    let second_cancel = CancellationToken::new();

    let first = {
        let client = client.clone();
        let cancel = first_cancel.clone();
        tokio::spawn(async move { client.subscribe(&cancel, "jobs").await })
    };
    let second = {
        let client = client.clone();
        let cancel = second_cancel.clone();
        tokio::spawn(async move { client.subscribe(&cancel, "jobs").await })
    };
    settle().await;

    broker.deliver("jobs", "only-one");
    settle().await;

    // whichever waiter did not get the message is still parked
    first_cancel.cancel();
    second_cancel.cancel();
    let results = [
        first.await.unwrap().unwrap(),
        second.await.unwrap().unwrap(),
    ];

    let delivered: Vec<_> = results.iter().flatten().collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload_str(), "only-one");
}

#[tokio::test]
async fn test_messages_arrive_in_broker_order() {
    let (client, broker, _) = connected_client().await;
    let cancel = CancellationToken::new();

    let waiter = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.subscribe(&cancel, "seq").await })
    };
    settle().await;

    for payload in ["a", "b", "c"] {
        broker.deliver("seq", payload);
    }

    let first = waiter.await.unwrap().unwrap().unwrap();
    assert_eq!(first.payload_str(), "a");
    for expected in ["b", "c"] {
        let next = client.subscribe(&cancel, "seq").await.unwrap().unwrap();
        assert_eq!(next.payload_str(), expected);
    }
    assert_eq!(broker.subscribe_count("seq"), 1);
}

#[tokio::test]
async fn test_cancelled_subscribe_returns_none() {
    let (client, _, _) = connected_client().await;
    let cancel = CancellationToken::new();

    let waiter = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.subscribe(&cancel, "quiet").await })
    };
    settle().await;
    cancel.cancel();

    let result = timeout(Duration::from_secs(1), waiter)
        .await
        .expect("cancellation wakes the waiter")
        .unwrap();
    assert!(result.unwrap().is_none());

    // the record stays for later callers
    assert_eq!(client.subscribed_topics().await, vec!["quiet".to_string()]);
}

#[tokio::test]
async fn test_unsubscribe_wakes_waiters_and_forgets_topic() {
    let (client, broker, _) = connected_client().await;

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.subscribe(&CancellationToken::new(), "temp").await })
    };
    settle().await;

    client.unsubscribe("temp").await.unwrap();

    let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert!(result.unwrap().is_none());
    assert!(client.subscribed_topics().await.is_empty());
    assert_eq!(broker.unsubscribe_count("temp"), 1);
    assert!(!broker.has_handler("temp"));
}

#[tokio::test]
async fn test_failed_broker_unsubscribe_still_removes_record() {
    let (client, broker, _) = connected_client().await;
    client
        .subscribe_with_function("alerts", |_| async { Ok(()) })
        .await
        .unwrap();
    broker.fail_unsubscribe("alerts");

    let err = client.unsubscribe("alerts").await.unwrap_err();
    assert!(matches!(err, PubSubError::UnsubscribeFailed { .. }));
    assert_eq!(err.topic(), Some("alerts"));
    assert!(client.subscribed_topics().await.is_empty());
}

#[tokio::test]
async fn test_callback_subscription_receives_and_ignores_errors() {
    let (client, broker, _) = connected_client().await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    client
        .subscribe_with_function("events/#", move |envelope| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(envelope.topic().to_string());
                let result: CallbackResult = Err("handler refused".into());
                result
            }
        })
        .await
        .unwrap();

    broker.deliver("events/login", "alice");
    broker.deliver("events/logout", "alice");

    let mut topics = Vec::new();
    for _ in 0..2 {
        let topic = timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        topics.push(topic);
    }
    topics.sort();
    assert_eq!(topics, vec!["events/login", "events/logout"]);
}
