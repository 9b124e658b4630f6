//! Bounded collection: subscribe, gather up to N messages or T time, unsubscribe
//!
//! A query owns a short-lived broker subscription that never enters the
//! registry. The subscription is held by a [`QueryGuard`]; the normal path
//! awaits its release, and if the query future is dropped or unwinds the
//! guard spawns the same best-effort unsubscribe.

use crate::envelope::Envelope;
use crate::error::PubSubError;
use crate::handler::HandlerFactory;
use crate::transport::{BrokerTransport, MessageHandler, QoS};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_QUERY_LIMIT: usize = 10;

/// Upper bound on a query's delivery queue; larger limits are still honored
/// by the collection loop
pub const MAX_QUERY_BUFFER: usize = 4096;

// Deadline used when `now + timeout` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Bounds for one query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// How long to collect; zero returns whatever is already queued
    pub timeout: Duration,
    /// Stop after this many messages; zero means time is the only bound
    pub limit: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_QUERY_TIMEOUT,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl QueryOptions {
    pub fn new(timeout: Duration, limit: usize) -> Self {
        Self { timeout, limit }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn limit_reached(&self, collected: usize) -> bool {
        self.limit > 0 && collected >= self.limit
    }
}

/// Runs queries against one transport
#[derive(Clone)]
pub struct QueryEngine {
    transport: Arc<dyn BrokerTransport>,
    factory: HandlerFactory,
    qos: QoS,
    channel_capacity: usize,
    subscribe_timeout: Duration,
    unsubscribe_timeout: Duration,
}

impl QueryEngine {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        factory: HandlerFactory,
        qos: QoS,
        channel_capacity: usize,
        subscribe_timeout: Duration,
        unsubscribe_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            factory,
            qos,
            channel_capacity,
            subscribe_timeout,
            unsubscribe_timeout,
        }
    }

    /// Collect newline-joined payloads from `topic`.
    ///
    /// Callers check connectivity and topic validity beforehand.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        options: QueryOptions,
    ) -> Result<Bytes, PubSubError> {
        let capacity = query_capacity(options.limit, self.channel_capacity);
        let (sender, mut receiver) = mpsc::channel(capacity);
        let handler = self.factory.queue_handler(topic, sender);

        let guard = self.subscribe_bounded(cancel, topic, handler).await?;
        debug!(
            topic = %topic,
            timeout = ?options.timeout,
            limit = options.limit,
            "Query subscription established"
        );

        let result = collect(&mut receiver, cancel, topic, options).await;
        guard.release().await;
        result
    }

    async fn subscribe_bounded(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<QueryGuard, PubSubError> {
        if cancel.is_cancelled() {
            return Err(PubSubError::Cancelled {
                topic: topic.to_string(),
            });
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PubSubError::Cancelled { topic: topic.to_string() }),
            result = tokio::time::timeout(
                self.subscribe_timeout,
                self.transport.subscribe(topic, self.qos, handler),
            ) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) => {
                    return Err(PubSubError::SubscriptionFailed { topic: topic.to_string(), source });
                }
                Err(_) => Err(PubSubError::SubscriptionTimeout { topic: topic.to_string() }),
            },
        };

        // Even on timeout or cancellation the broker may still complete the
        // request, so the guard is created either way.
        let guard = QueryGuard::new(self.transport.clone(), topic, self.unsubscribe_timeout);
        match outcome {
            Ok(()) => Ok(guard),
            Err(error) => {
                warn!(topic = %topic, error = %error, "Query subscription did not complete");
                drop(guard);
                Err(error)
            }
        }
    }
}

fn query_capacity(limit: usize, channel_capacity: usize) -> usize {
    if limit > 0 {
        limit.min(MAX_QUERY_BUFFER).max(channel_capacity)
    } else {
        channel_capacity
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Collection loop. Public for engine-level tests.
pub async fn collect(
    receiver: &mut mpsc::Receiver<Envelope>,
    cancel: &CancellationToken,
    topic: &str,
    options: QueryOptions,
) -> Result<Bytes, PubSubError> {
    let deadline = deadline_after(options.timeout);
    let mut buffer = BytesMut::new();
    let mut collected = 0usize;

    while !options.limit_reached(collected) {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(topic = %topic, collected, "Query cancelled by caller");
                return Err(PubSubError::QueryCancelled {
                    topic: topic.to_string(),
                    partial: buffer.freeze(),
                });
            }
            _ = tokio::time::sleep_until(deadline) => {
                // take what is already queued, then stop
                while !options.limit_reached(collected) {
                    match receiver.try_recv() {
                        Ok(envelope) => append(&mut buffer, &mut collected, &envelope),
                        Err(_) => break,
                    }
                }
                break;
            }
            received = receiver.recv() => match received {
                Some(envelope) => append(&mut buffer, &mut collected, &envelope),
                None => break,
            },
        }
    }

    if collected == 0 {
        info!(topic = %topic, "Query collected no messages");
        return Ok(Bytes::new());
    }

    debug!(topic = %topic, collected, bytes = buffer.len(), "Query finished");
    Ok(buffer.freeze())
}

fn append(buffer: &mut BytesMut, collected: &mut usize, envelope: &Envelope) {
    if *collected > 0 {
        buffer.put_u8(b'\n');
    }
    buffer.extend_from_slice(envelope.payload());
    *collected += 1;
}

/// Owns a query's broker subscription until released
pub struct QueryGuard {
    transport: Arc<dyn BrokerTransport>,
    topic: String,
    timeout: Duration,
    released: bool,
}

impl QueryGuard {
    fn new(transport: Arc<dyn BrokerTransport>, topic: &str, timeout: Duration) -> Self {
        Self {
            transport,
            topic: topic.to_string(),
            timeout,
            released: false,
        }
    }

    /// Unsubscribe now, bounded by the guard's timeout
    pub async fn release(mut self) {
        self.released = true;
        release_subscription(self.transport.clone(), self.topic.clone(), self.timeout).await;
    }
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release_subscription(
                    self.transport.clone(),
                    std::mem::take(&mut self.topic),
                    self.timeout,
                ));
            }
            Err(_) => {
                warn!(topic = %self.topic, "No runtime available, query subscription left in place");
            }
        }
    }
}

async fn release_subscription(transport: Arc<dyn BrokerTransport>, topic: String, timeout: Duration) {
    match tokio::time::timeout(timeout, transport.unsubscribe(&topic)).await {
        Ok(Ok(())) => debug!(topic = %topic, "Query subscription released"),
        Ok(Err(e)) => warn!(topic = %topic, error = %e, "Failed to release query subscription"),
        Err(_) => warn!(
            topic = %topic,
            timeout = ?timeout,
            "Timed out releasing query subscription"
        ),
    }
}
