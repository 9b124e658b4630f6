//! `PubSubClient`: the public face of the engine
//!
//! Owns the subscription registry, the query engine and the shared transport.
//! The reconnection coordinator is installed on the transport before the first
//! connect; if that connect fails the client is still returned and a bootstrap
//! task keeps retrying in the background.

use crate::config::{ClientConfig, EngineSection};
use crate::envelope::Envelope;
use crate::error::{PubSubError, PubSubResult};
use crate::handler::{CallbackResult, HandlerFactory};
use crate::health::{Health, HealthCheck};
use crate::observability::metrics::{
    metrics, MetricsSink, PUBLISH_FAILURE, PUBLISH_SUCCESS, SUBSCRIBE_FAILURE, SUBSCRIBE_SUCCESS,
};
use crate::query::{QueryEngine, QueryOptions};
use crate::reconnect::ReconnectionCoordinator;
use crate::registry::{SubscriptionRecord, SubscriptionRegistry};
use crate::transport::mqtt::{HealthMonitor, MqttTransport, ReconnectConfig, ReconnectionDecision};
use crate::transport::{BrokerTransport, MessageHandler, QoS, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

pub struct PubSubClient {
    transport: Arc<dyn BrokerTransport>,
    registry: Arc<SubscriptionRegistry>,
    factory: HandlerFactory,
    queries: QueryEngine,
    metrics: Arc<dyn MetricsSink>,
    qos: QoS,
    retain: bool,
    engine: EngineSection,
    shutdown: CancellationToken,
    bootstrap: Mutex<Option<JoinHandle<()>>>,
}

impl PubSubClient {
    /// Wire the engine onto `transport` and attempt the first connect.
    ///
    /// Only configuration errors fail construction. A refused connect is
    /// logged and retried in the background per `config.reconnect`.
    pub async fn connect(
        config: ClientConfig,
        transport: Arc<dyn BrokerTransport>,
        metrics: Arc<dyn MetricsSink>,
    ) -> PubSubResult<Self> {
        config.validate()?;
        let qos = config.broker.qos_level()?;

        let registry = Arc::new(SubscriptionRegistry::new());
        let coordinator =
            ReconnectionCoordinator::new(registry.clone(), &transport, metrics.clone());
        transport.set_observer(Arc::new(coordinator));

        let factory = HandlerFactory::new(metrics.clone());
        let queries = QueryEngine::new(
            transport.clone(),
            factory.clone(),
            qos,
            config.engine.channel_capacity,
            config.engine.subscribe_timeout(),
            config.engine.unsubscribe_timeout(),
        );

        let client = Self {
            transport,
            registry,
            factory,
            queries,
            metrics,
            qos,
            retain: config.broker.retain,
            engine: config.engine.clone(),
            shutdown: CancellationToken::new(),
            bootstrap: Mutex::new(None),
        };

        let host = client.transport.broker_host();
        match client.transport.connect().await {
            Ok(()) => info!(host = %host, "Connected to broker"),
            Err(e) => {
                error!(host = %host, error = %e, "Initial broker connection failed, retrying in background");
                client.spawn_bootstrap(config.reconnect);
            }
        }

        Ok(client)
    }

    /// Build an [`MqttTransport`] from `config` and connect through it,
    /// counting into the process-wide metrics
    pub async fn connect_mqtt(config: ClientConfig) -> PubSubResult<Self> {
        let transport: Arc<dyn BrokerTransport> = Arc::new(MqttTransport::new(&config)?);
        Self::connect(config, transport, Arc::new(metrics())).await
    }

    fn spawn_bootstrap(&self, reconnect: ReconnectConfig) {
        let transport = self.transport.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                match HealthMonitor::should_attempt_reconnection(
                    failures,
                    &reconnect,
                    shutdown.is_cancelled(),
                ) {
                    ReconnectionDecision::Proceed { attempt, delay_ms } => {
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                debug!("Bootstrap retry stopped by shutdown");
                                return;
                            }
                            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                        }

                        match transport.connect().await {
                            Ok(()) => {
                                info!(attempt, "Connected to broker after retry");
                                return;
                            }
                            Err(e) => {
                                warn!(attempt, error = %e, "Broker connection retry failed");
                                failures = attempt;
                            }
                        }
                    }
                    ReconnectionDecision::AbortShutdownRequested => return,
                    ReconnectionDecision::AbortMaxAttemptsExceeded => {
                        error!(attempts = failures, "Giving up on broker connection");
                        return;
                    }
                }
            }
        });

        *self.bootstrap.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Wait for the next message on `topic`.
    ///
    /// The first caller for a topic creates the broker subscription; later
    /// callers share its queue and each message goes to exactly one of them.
    /// Cancellation yields `Ok(None)`.
    pub async fn subscribe(
        &self,
        cancel: &CancellationToken,
        topic: &str,
    ) -> PubSubResult<Option<Envelope>> {
        if topic.is_empty() {
            return Err(PubSubError::EmptyTopic);
        }
        self.wait_until_connected(cancel).await?;

        let (record, created) = self
            .registry
            .get_or_try_insert_with(topic, || self.create_queue_record(topic))
            .await?;
        if created {
            debug!(topic = %topic, "Created subscription record");
        }
        if record.is_callback() {
            return Err(PubSubError::TopicBoundToCallback {
                topic: topic.to_string(),
            });
        }

        let envelope = record
            .next(cancel)
            .instrument(crate::subscription_span!(topic = %topic))
            .await;
        if envelope.is_none() {
            debug!(topic = %topic, "Subscribe wait ended without a message");
        }
        Ok(envelope)
    }

    /// Deliver every message on `topic` to `callback` on a spawned task.
    /// Errors returned by the callback are discarded.
    pub async fn subscribe_with_function<F, Fut>(&self, topic: &str, callback: F) -> PubSubResult<()>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        if topic.is_empty() {
            return Err(PubSubError::EmptyTopic);
        }
        if !self.transport.is_connected() {
            return Err(PubSubError::NotConnected);
        }

        let handler = self.factory.callback_handler(topic, callback);
        let (_, created) = self
            .registry
            .get_or_try_insert_with(topic, || async {
                self.broker_subscribe(topic, handler.clone()).await?;
                Ok::<_, PubSubError>(SubscriptionRecord::callback(topic, self.qos, handler))
            })
            .await?;

        if !created {
            return Err(PubSubError::AlreadySubscribed {
                topic: topic.to_string(),
            });
        }
        info!(topic = %topic, "Callback subscription registered");
        Ok(())
    }

    /// Collect messages from `topic` until `options.limit` or `options.timeout`
    pub async fn query(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        options: QueryOptions,
    ) -> PubSubResult<Bytes> {
        if !self.transport.is_connected() {
            return Err(PubSubError::NotConnected);
        }
        if topic.is_empty() {
            return Err(PubSubError::EmptyTopic);
        }

        self.queries
            .run(cancel, topic, options)
            .instrument(crate::query_span!(
                topic = %topic,
                timeout = ?options.timeout,
                limit = options.limit
            ))
            .await
    }

    /// Query bounds taken from the `[engine]` config section
    pub fn default_query_options(&self) -> QueryOptions {
        QueryOptions::new(self.engine.query_timeout(), self.engine.query_limit)
    }

    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> PubSubResult<()> {
        if topic.is_empty() {
            return Err(PubSubError::EmptyTopic);
        }
        if !self.transport.is_connected() {
            return Err(PubSubError::NotConnected);
        }

        let payload = payload.into();
        let size = payload.len();
        match self
            .transport
            .publish(topic, self.qos, self.retain, payload)
            .await
        {
            Ok(()) => {
                debug!(topic = %topic, bytes = size, "Published message");
                self.metrics
                    .increment_counter(PUBLISH_SUCCESS, &[("topic", topic)]);
                Ok(())
            }
            Err(source) => {
                error!(topic = %topic, error = %source, "Publish failed");
                self.metrics
                    .increment_counter(PUBLISH_FAILURE, &[("topic", topic)]);
                Err(PubSubError::PublishFailed {
                    topic: topic.to_string(),
                    source,
                })
            }
        }
    }

    /// Drop the long-lived subscription for `topic` and wake its waiters.
    ///
    /// The record is removed even when the broker refuses; that refusal is
    /// still returned. Unknown topics are a no-op.
    pub async fn unsubscribe(&self, topic: &str) -> PubSubResult<()> {
        let timeout = self.engine.unsubscribe_timeout();
        let released = self
            .registry
            .release_with(topic, || async {
                match tokio::time::timeout(timeout, self.transport.unsubscribe(topic)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(timeout)),
                }
            })
            .await;

        match released {
            None => {
                debug!(topic = %topic, "Unsubscribe for untracked topic ignored");
                Ok(())
            }
            Some(Ok(())) => {
                info!(topic = %topic, "Unsubscribed");
                Ok(())
            }
            Some(Err(source)) => {
                warn!(topic = %topic, error = %source, "Broker unsubscribe failed, record removed");
                Err(PubSubError::UnsubscribeFailed {
                    topic: topic.to_string(),
                    source,
                })
            }
        }
    }

    /// Unsubscribe every tracked topic, then close the transport.
    ///
    /// Every topic is attempted; failures are collected into
    /// [`PubSubError::Disconnect`]. The registry is empty afterwards.
    pub async fn disconnect(&self, wait: Duration) -> PubSubResult<()> {
        self.shutdown.cancel();
        if let Some(handle) = self
            .bootstrap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let mut errors = Vec::new();
        for topic in self.registry.topics().await {
            if let Err(e) = self.unsubscribe(&topic).await {
                errors.push(e);
            }
        }

        if let Err(e) = self.transport.disconnect(wait).await {
            warn!(error = %e, "Transport disconnect failed");
            errors.push(PubSubError::Transport(e));
        }

        if errors.is_empty() {
            info!("Disconnected from broker");
            Ok(())
        } else {
            warn!(failures = errors.len(), "Disconnect finished with errors");
            Err(PubSubError::Disconnect(errors))
        }
    }

    pub async fn health(&self) -> Health {
        let host = self.transport.broker_host();
        let state = format!("{:?}", self.transport.connection_state());
        let base = if self.transport.is_connected() {
            Health::up(host)
        } else {
            Health::down(host)
        };
        base.with_detail("state", state)
            .with_detail("subscriptions", self.registry.len().await.to_string())
    }

    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.registry.topics().await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Not-connected callers back off before failing, unless cancelled first
    async fn wait_until_connected(&self, cancel: &CancellationToken) -> PubSubResult<()> {
        if self.transport.is_connected() {
            return Ok(());
        }

        let retry = self.engine.not_connected_retry();
        warn!(retry = ?retry, "Subscribe while not connected");
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(retry) => {}
        }
        Err(PubSubError::NotConnected)
    }

    async fn create_queue_record(&self, topic: &str) -> PubSubResult<SubscriptionRecord> {
        let (sender, receiver) = mpsc::channel(self.engine.channel_capacity);
        let handler = self.factory.queue_handler(topic, sender);
        self.broker_subscribe(topic, handler.clone()).await?;
        Ok(SubscriptionRecord::queue(topic, self.qos, handler, receiver))
    }

    async fn broker_subscribe(&self, topic: &str, handler: MessageHandler) -> PubSubResult<()> {
        let timeout = self.engine.subscribe_timeout();
        let result = tokio::time::timeout(timeout, self.transport.subscribe(topic, self.qos, handler))
            .await
            .map_err(|_| PubSubError::SubscriptionTimeout {
                topic: topic.to_string(),
            })
            .and_then(|result| {
                result.map_err(|source| PubSubError::SubscriptionFailed {
                    topic: topic.to_string(),
                    source,
                })
            });

        match &result {
            Ok(()) => {
                info!(topic = %topic, "Subscribed");
                self.metrics
                    .increment_counter(SUBSCRIBE_SUCCESS, &[("topic", topic)]);
            }
            Err(e) => {
                error!(topic = %topic, error = %e, "Subscribe failed");
                self.metrics
                    .increment_counter(SUBSCRIBE_FAILURE, &[("topic", topic)]);
            }
        }
        result
    }
}

#[async_trait]
impl HealthCheck for PubSubClient {
    async fn health(&self) -> Health {
        PubSubClient::health(self).await
    }
}

impl Drop for PubSubClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self
            .bootstrap
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
