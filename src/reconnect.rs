//! Reconnection coordinator
//!
//! Installed on the transport as its [`ConnectionObserver`] before the first
//! connect. Every ConnAck (the first one included) triggers a resubscription
//! of all registry records with their original QoS and handler.

use crate::observability::metrics::{MetricsSink, RESUBSCRIBE_FAILURE};
use crate::registry::SubscriptionRegistry;
use crate::transport::{BrokerTransport, ConnectionObserver};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ReconnectionCoordinator {
    registry: Arc<SubscriptionRegistry>,
    // weak: the transport owns this coordinator through its observer slot
    transport: Weak<dyn BrokerTransport>,
    metrics: Arc<dyn MetricsSink>,
}

impl ReconnectionCoordinator {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        transport: &Arc<dyn BrokerTransport>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            transport: Arc::downgrade(transport),
            metrics,
        }
    }

    /// Reissue every tracked subscription. Failures are logged and counted,
    /// never returned. Returns how many succeeded.
    pub async fn resubscribe_all(&self) -> usize {
        let Some(transport) = self.transport.upgrade() else {
            debug!("Transport dropped, skipping resubscription");
            return 0;
        };

        let records = self.registry.snapshot().await;
        if records.is_empty() {
            return 0;
        }

        info!(count = records.len(), "Restoring subscriptions after connect");
        let mut restored = 0;
        for record in &records {
            match record.resubscribe(transport.as_ref()).await {
                Ok(()) => {
                    debug!(topic = %record.topic(), "Subscription restored");
                    restored += 1;
                }
                Err(e) => {
                    warn!(topic = %record.topic(), error = %e, "Failed to restore subscription");
                    self.metrics
                        .increment_counter(RESUBSCRIBE_FAILURE, &[("topic", record.topic())]);
                }
            }
        }

        info!(restored, total = records.len(), "Resubscription finished");
        restored
    }
}

impl ConnectionObserver for ReconnectionCoordinator {
    fn on_connected(&self) {
        // the transport calls this from its I/O task, which must keep
        // polling for the SubAcks
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.resubscribe_all().await;
        });
    }

    fn on_connection_lost(&self, reason: &str) {
        warn!(reason = %reason, "Connection lost, subscriptions kept for restore");
    }

    fn on_reconnecting(&self, attempt: u32) {
        info!(attempt, "Reconnecting to broker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::CounterMetrics;
    use crate::registry::SubscriptionRecord;
    use crate::testing::mocks::MockBroker;
    use crate::transport::{MessageHandler, QoS};

    async fn track(registry: &SubscriptionRegistry, topic: &str) {
        let handler: MessageHandler = Arc::new(|_| {});
        registry
            .get_or_try_insert_with(topic, || async {
                Ok::<_, ()>(SubscriptionRecord::callback(topic, QoS::AtLeastOnce, handler))
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resubscribe_all_counts_successes() {
        let broker = Arc::new(MockBroker::new());
        broker.set_connected(true);
        broker.fail_subscribe("b");
        let transport: Arc<dyn BrokerTransport> = broker.clone();

        let registry = Arc::new(SubscriptionRegistry::new());
        for topic in ["a", "b", "c"] {
            track(&registry, topic).await;
        }

        let metrics = Arc::new(CounterMetrics::new());
        let coordinator = ReconnectionCoordinator::new(registry, &transport, metrics.clone());

        assert_eq!(coordinator.resubscribe_all().await, 2);
        assert_eq!(broker.subscribe_count("a"), 1);
        assert_eq!(broker.subscribe_count("c"), 1);
        assert_eq!(metrics.counter(RESUBSCRIBE_FAILURE, &[("topic", "b")]), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_after_transport_dropped() {
        let registry = Arc::new(SubscriptionRegistry::new());
        track(&registry, "a").await;

        let transport: Arc<dyn BrokerTransport> = Arc::new(MockBroker::new());
        let coordinator = ReconnectionCoordinator::new(
            registry,
            &transport,
            Arc::new(crate::observability::metrics::NoopMetrics),
        );
        drop(transport);

        assert_eq!(coordinator.resubscribe_all().await, 0);
    }
}
