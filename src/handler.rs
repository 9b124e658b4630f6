//! Handler factory: broker callbacks that feed delivery queues
//!
//! Handlers run on the transport's I/O task, so they never await. Queue
//! handlers use `try_send` and drop the message when the queue is full;
//! callback handlers hand each envelope to a spawned task.

use crate::envelope::{Envelope, META_DUPLICATE, META_MESSAGE_ID, META_QOS, META_RETAINED};
use crate::observability::metrics::{MetricsSink, MESSAGES_DROPPED, MESSAGES_RECEIVED};
use crate::transport::{qos_number, MessageHandler, RawMessage};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Result returned by `subscribe_with_function` callbacks
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Builds broker-facing handlers that share one metrics sink
#[derive(Clone)]
pub struct HandlerFactory {
    metrics: Arc<dyn MetricsSink>,
}

impl HandlerFactory {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self { metrics }
    }

    /// Normalize a raw delivery into an envelope with a fresh correlation id
    pub fn build_envelope(raw: RawMessage) -> Envelope {
        let mut metadata = HashMap::with_capacity(4);
        metadata.insert(META_QOS.to_string(), qos_number(raw.qos).to_string());
        metadata.insert(META_RETAINED.to_string(), raw.retain.to_string());
        metadata.insert(META_MESSAGE_ID.to_string(), raw.packet_id.to_string());
        metadata.insert(META_DUPLICATE.to_string(), raw.duplicate.to_string());

        Envelope::new(raw.topic, raw.payload, metadata, raw.committer)
    }

    /// Handler pushing envelopes into `sender` without ever blocking
    pub fn queue_handler(&self, topic: &str, sender: mpsc::Sender<Envelope>) -> MessageHandler {
        let topic = topic.to_string();
        let metrics = self.metrics.clone();

        Arc::new(move |raw: RawMessage| {
            let envelope = Self::build_envelope(raw);
            let correlation_id = envelope.correlation_id();
            metrics.increment_counter(MESSAGES_RECEIVED, &[("topic", &topic)]);

            match sender.try_send(envelope) {
                Ok(()) => {
                    debug!(topic = %topic, %correlation_id, "Queued incoming message");
                }
                Err(TrySendError::Full(dropped)) => {
                    warn!(
                        topic = %topic,
                        %correlation_id,
                        message_topic = %dropped.topic(),
                        "Delivery queue full, dropping message"
                    );
                    metrics.increment_counter(
                        MESSAGES_DROPPED,
                        &[("topic", &topic), ("reason", "queue_full")],
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(topic = %topic, %correlation_id, "Delivery queue closed, dropping message");
                    metrics.increment_counter(
                        MESSAGES_DROPPED,
                        &[("topic", &topic), ("reason", "queue_closed")],
                    );
                }
            }
        })
    }

    /// Handler running `callback` on a spawned task for every message.
    /// The callback's error is discarded.
    pub fn callback_handler<F, Fut>(&self, topic: &str, callback: F) -> MessageHandler
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        let topic = topic.to_string();
        let metrics = self.metrics.clone();
        let callback = Arc::new(callback);

        Arc::new(move |raw: RawMessage| {
            let envelope = Self::build_envelope(raw);
            metrics.increment_counter(MESSAGES_RECEIVED, &[("topic", &topic)]);
            debug!(
                topic = %topic,
                correlation_id = %envelope.correlation_id(),
                "Dispatching message to callback"
            );

            let future = callback(envelope);
            tokio::spawn(async move {
                let _ = future.await;
            });
        })
    }
}
