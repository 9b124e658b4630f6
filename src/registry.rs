//! Subscription registry: at most one broker subscription per topic
//!
//! Each record keeps the exact handler and QoS it was subscribed with so the
//! reconnection coordinator can reissue the subscription unchanged. Queue
//! records share one bounded receiver between every waiting caller: each
//! message goes to exactly one waiter, in arrival order.

use crate::envelope::Envelope;
use crate::transport::{BrokerTransport, MessageHandler, QoS, TransportError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum Delivery {
    Queue(Arc<Mutex<mpsc::Receiver<Envelope>>>),
    Callback,
}

/// One active long-lived subscription
#[derive(Clone)]
pub struct SubscriptionRecord {
    topic: String,
    qos: QoS,
    handler: MessageHandler,
    delivery: Delivery,
    closed: CancellationToken,
}

impl SubscriptionRecord {
    /// Record whose messages are pulled by `subscribe` callers
    pub fn queue(
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
        receiver: mpsc::Receiver<Envelope>,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            qos,
            handler,
            delivery: Delivery::Queue(Arc::new(Mutex::new(receiver))),
            closed: CancellationToken::new(),
        }
    }

    /// Record whose messages are pushed to a callback
    pub fn callback(topic: &str, qos: QoS, handler: MessageHandler) -> Self {
        Self {
            topic: topic.to_string(),
            qos,
            handler,
            delivery: Delivery::Callback,
            closed: CancellationToken::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn handler(&self) -> MessageHandler {
        self.handler.clone()
    }

    pub fn is_callback(&self) -> bool {
        matches!(self.delivery, Delivery::Callback)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Reissue the broker subscription with the original wiring
    pub async fn resubscribe(&self, transport: &dyn BrokerTransport) -> Result<(), TransportError> {
        transport
            .subscribe(&self.topic, self.qos, self.handler.clone())
            .await
    }

    /// Wait for the next queued message.
    ///
    /// Returns `None` when `cancel` fires, when the record is closed, or for
    /// callback records. Cancellation wins over a ready message.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<Envelope> {
        let Delivery::Queue(receiver) = &self.delivery else {
            return None;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = self.closed.cancelled() => None,
            envelope = async { receiver.lock().await.recv().await } => envelope,
        }
    }

    /// Wake every waiter; later `next` calls return `None` immediately
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for SubscriptionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRecord")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("callback", &self.is_callback())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Topic → record map guarded by a read/write lock
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, SubscriptionRecord>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, topic: &str) -> Option<SubscriptionRecord> {
        self.entries.read().await.get(topic).cloned()
    }

    pub async fn contains(&self, topic: &str) -> bool {
        self.entries.read().await.contains_key(topic)
    }

    /// Return the record for `topic`, creating it with `create` if absent.
    ///
    /// The write lock is held across `create`, so concurrent callers for the
    /// same new topic run `create` exactly once. On `Err` nothing is stored.
    /// The boolean is `true` when this call created the record.
    pub async fn get_or_try_insert_with<F, Fut, E>(
        &self,
        topic: &str,
        create: F,
    ) -> Result<(SubscriptionRecord, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SubscriptionRecord, E>>,
    {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(topic) {
            return Ok((existing.clone(), false));
        }

        let record = create().await?;
        entries.insert(topic.to_string(), record.clone());
        Ok((record, true))
    }

    /// Run `release` for a tracked topic while holding the read lock, then
    /// remove and close the record whatever `release` returned.
    ///
    /// Returns `None` without calling `release` when `topic` is unknown.
    pub async fn release_with<F, Fut, T>(&self, topic: &str, release: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let outcome = {
            let entries = self.entries.read().await;
            if !entries.contains_key(topic) {
                return None;
            }
            release().await
        };

        self.remove(topic).await;
        Some(outcome)
    }

    /// Remove and close the record for `topic`
    pub async fn remove(&self, topic: &str) -> Option<SubscriptionRecord> {
        let removed = self.entries.write().await.remove(topic);
        if let Some(record) = &removed {
            record.close();
        }
        removed
    }

    /// Consistent copy of every record, taken under the read lock
    pub async fn snapshot(&self) -> Vec<SubscriptionRecord> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.entries.read().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn noop_handler() -> MessageHandler {
        Arc::new(|_| {})
    }

    fn envelope(payload: &'static str) -> Envelope {
        Envelope::new(
            "t".to_string(),
            Bytes::from_static(payload.as_bytes()),
            HashMap::new(),
            None,
        )
    }

    #[tokio::test]
    async fn test_get_or_insert_creates_once() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let creations = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let creations = creations.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .get_or_try_insert_with("t", || async {
                        creations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        let (_tx, rx) = mpsc::channel(1);
                        Ok::<_, ()>(SubscriptionRecord::queue(
                            "t",
                            QoS::AtLeastOnce,
                            noop_handler(),
                            rx,
                        ))
                    })
                    .await
                    .map(|(_, created)| created)
            }));
        }

        let mut created_count = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                created_count += 1;
            }
        }

        assert_eq!(creations.load(Ordering::SeqCst), 1);
        assert_eq!(created_count, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_creation_stores_nothing() {
        let registry = SubscriptionRegistry::new();

        let result = registry
            .get_or_try_insert_with("t", || async { Err::<SubscriptionRecord, _>("refused") })
            .await;

        assert_eq!(result.unwrap_err(), "refused");
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_next_returns_queued_message() {
        let (tx, rx) = mpsc::channel(2);
        let record = SubscriptionRecord::queue("t", QoS::AtMostOnce, noop_handler(), rx);
        tx.try_send(envelope("hello")).unwrap();

        let received = record.next(&CancellationToken::new()).await.unwrap();
        assert_eq!(received.payload_str(), "hello");
    }

    #[tokio::test]
    async fn test_next_prefers_cancellation() {
        let (tx, rx) = mpsc::channel(2);
        let record = SubscriptionRecord::queue("t", QoS::AtMostOnce, noop_handler(), rx);
        tx.try_send(envelope("kept for later")).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(record.next(&cancel).await.is_none());

        // the message was not consumed by the cancelled waiter
        let received = record.next(&CancellationToken::new()).await.unwrap();
        assert_eq!(received.payload_str(), "kept for later");
    }

    #[tokio::test]
    async fn test_remove_wakes_waiters() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (_tx, rx) = mpsc::channel(1);
        let (record, _) = registry
            .get_or_try_insert_with("t", || async {
                Ok::<_, ()>(SubscriptionRecord::queue("t", QoS::AtMostOnce, noop_handler(), rx))
            })
            .await
            .unwrap();

        let waiter = tokio::spawn(async move { record.next(&CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let removed = registry.remove("t").await.unwrap();
        assert!(removed.is_closed());
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
        assert!(registry.remove("t").await.is_none());
    }

    #[tokio::test]
    async fn test_release_with_removes_even_on_failure() {
        let registry = SubscriptionRegistry::new();
        let calls = AtomicUsize::new(0);

        let unknown = registry
            .release_with("t", || async {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(unknown.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        registry
            .get_or_try_insert_with("t", || async {
                Ok::<_, ()>(SubscriptionRecord::callback("t", QoS::AtMostOnce, noop_handler()))
            })
            .await
            .unwrap();

        let outcome = registry
            .release_with("t", || async {
                // lookups stay possible while the release runs
                assert!(registry.contains("t").await);
                Err::<(), _>("broker refused")
            })
            .await;
        assert_eq!(outcome, Some(Err("broker refused")));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_callback_record_has_no_queue() {
        let record = SubscriptionRecord::callback("t", QoS::AtLeastOnce, noop_handler());
        assert!(record.is_callback());
        assert!(record.next(&CancellationToken::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_topics_are_sorted() {
        let registry = SubscriptionRegistry::new();
        for topic in ["c", "a", "b"] {
            registry
                .get_or_try_insert_with(topic, || async {
                    Ok::<_, ()>(SubscriptionRecord::callback(topic, QoS::AtMostOnce, noop_handler()))
                })
                .await
                .unwrap();
        }

        assert_eq!(registry.topics().await, vec!["a", "b", "c"]);
        assert_eq!(registry.snapshot().await.len(), 3);
    }
}
