//! Impure I/O for the MQTT transport
//!
//! [`MqttTransport`] owns the `rumqttc` client and a supervisor task that
//! polls the event loop. The supervisor tracks [`ConnectionState`] on a watch
//! channel, reports lifecycle changes to the installed observer, resolves
//! SubAck/UnsubAck waiters and dispatches publishes through the router.

use super::connection::{configure_mqtt_options, ConnectionState, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{route_mqtt_event, AckKind, AckTracker, EventRoute, HandlerRouter};
use crate::config::{ClientConfig, ConfigError};
use crate::envelope::Committer;
use crate::transport::{
    BrokerTransport, ConnectionObserver, MessageHandler, QoS, RawMessage, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Publish;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Requests the client may queue before `try_*` calls fail
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// State shared between the transport handle and its supervisor task
struct Shared {
    client: AsyncClient,
    router: HandlerRouter,
    acks: AckTracker,
    state_tx: watch::Sender<ConnectionState>,
    observer: RwLock<Option<Arc<dyn ConnectionObserver>>>,
    reconnect: ReconnectConfig,
    manual_acks: bool,
    closing: AtomicBool,
}

impl Shared {
    fn observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transition(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            HealthMonitor::log_state_transition(&previous, &next);
        }
    }

    fn lose_connection(&self, reason: &str, was_connected: &mut bool) {
        self.acks.on_connection_lost(reason);
        if std::mem::take(was_connected) {
            if let Some(observer) = self.observer() {
                observer.on_connection_lost(reason);
            }
        }
    }

    /// Returns `false` when the supervisor should stop
    fn process_event_route(
        &self,
        route: EventRoute,
        failures: &mut u32,
        was_connected: &mut bool,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                *failures = 0;
                *was_connected = true;
                self.transition(ConnectionEvent::ConnAckReceived);
                if let Some(observer) = self.observer() {
                    observer.on_connected();
                }
            }
            EventRoute::ConnectionRefused(reason) => {
                self.transition(ConnectionEvent::NetworkError(format!(
                    "Connection refused: {reason}"
                )));
            }
            EventRoute::MessageReceived(publish) => self.dispatch(publish),
            EventRoute::Disconnected => {
                self.transition(ConnectionEvent::DisconnectedByBroker);
                self.lose_connection("Broker disconnected", was_connected);
            }
            EventRoute::SubscribeSent(packet_id) => self.acks.on_sent(AckKind::Subscribe, packet_id),
            EventRoute::UnsubscribeSent(packet_id) => {
                self.acks.on_sent(AckKind::Unsubscribe, packet_id)
            }
            EventRoute::SubscriptionAcknowledged {
                packet_id,
                failures,
            } => {
                if !self.acks.on_ack(AckKind::Subscribe, packet_id, failures) {
                    debug!(packet_id, "SubAck without a waiting request");
                }
            }
            EventRoute::UnsubscriptionAcknowledged {
                packet_id,
                failures,
            } => {
                if !self.acks.on_ack(AckKind::Unsubscribe, packet_id, failures) {
                    debug!(packet_id, "UnsubAck without a waiting request");
                }
            }
            EventRoute::DisconnectSent => {
                if self.closing.load(Ordering::SeqCst) {
                    return false;
                }
            }
            EventRoute::InfrastructureEvent => {}
        }
        true
    }

    fn dispatch(&self, publish: Publish) {
        let topic = String::from_utf8_lossy(&publish.topic).to_string();
        let committer = self.committer_for(&publish);
        let handlers = self.router.matching(&topic);

        if handlers.is_empty() {
            debug!(topic = %topic, "Publish without a matching route");
            if let Some(committer) = committer {
                committer.commit();
            }
            return;
        }

        for handler in handlers {
            handler(RawMessage {
                topic: topic.clone(),
                payload: publish.payload.clone(),
                qos: publish.qos,
                retain: publish.retain,
                duplicate: publish.dup,
                packet_id: publish.pkid,
                committer: committer.clone(),
            });
        }
    }

    fn committer_for(&self, publish: &Publish) -> Option<Arc<dyn Committer>> {
        if !self.manual_acks || publish.qos == QoS::AtMostOnce {
            return None;
        }
        Some(Arc::new(PublishAck::new(self.client.clone(), publish.clone())))
    }
}

/// Manual acknowledgement for one QoS 1/2 publish, sent at most once
pub struct PublishAck {
    client: AsyncClient,
    publish: Publish,
    done: AtomicBool,
}

impl PublishAck {
    pub fn new(client: AsyncClient, publish: Publish) -> Self {
        Self {
            client,
            publish,
            done: AtomicBool::new(false),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

impl Committer for PublishAck {
    fn commit(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.client.try_ack(&self.publish) {
            warn!(packet_id = self.publish.pkid, error = %e, "Failed to queue manual ack");
        }
    }
}

/// `rumqttc` v5 implementation of [`BrokerTransport`]
pub struct MqttTransport {
    shared: Arc<Shared>,
    event_loop: Mutex<Option<EventLoop>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    connect_timeout: Duration,
    host: String,
}

impl MqttTransport {
    /// Build the client from configuration. No I/O happens until `connect`.
    pub fn new(config: &ClientConfig) -> Result<Self, ConfigError> {
        let endpoint = config.broker.endpoint()?;
        let mqtt_options = configure_mqtt_options(config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let ((state_tx, state_rx), (shutdown_tx, _)) = Self::setup_connection_channels();

        Ok(Self {
            shared: Arc::new(Shared {
                client,
                router: HandlerRouter::new(),
                acks: AckTracker::new(),
                state_tx,
                observer: RwLock::new(None),
                reconnect: config.reconnect.clone(),
                manual_acks: config.broker.manual_acks,
                closing: AtomicBool::new(false),
            }),
            event_loop: Mutex::new(Some(event_loop)),
            supervisor: Mutex::new(None),
            state_rx,
            shutdown_tx,
            connect_timeout: HealthMonitor::calculate_connection_timeout(
                &config.reconnect,
                config.engine.connect_timeout(),
            ),
            host: endpoint.host,
        })
    }

    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        (
            watch::channel(ConnectionState::Connecting),
            watch::channel(false),
        )
    }

    /// Wait for ConnAck, failing on an explicit disconnect or timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let waited = tokio::time::timeout(timeout, async {
            match &*state_rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::PermanentlyDisconnected(reason) => {
                    return Err(TransportError::ConnectionFailed(format!(
                        "Permanently disconnected: {reason}"
                    )));
                }
                _ => {}
            }

            loop {
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectionFailed(
                        "State channel closed".to_string(),
                    ));
                }
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(TransportError::ConnectionFailed(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(TransportError::ConnectionFailed(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionFailed(format!(
                "ConnAck timeout after {} ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Sleep unless shutdown is signalled first. Returns `false` on shutdown.
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        if *shutdown_rx.borrow() {
            return false;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signalled during reconnection delay");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Spawn the supervisor on first use
    fn ensure_supervisor(&self) -> Result<(), TransportError> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "Transport has been shut down".to_string(),
            ));
        }

        let Some(event_loop) = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        let handle = tokio::spawn(Self::run_supervisor(
            self.shared.clone(),
            event_loop,
            self.shutdown_tx.subscribe(),
        ));
        *self.supervisor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    async fn run_supervisor(
        shared: Arc<Shared>,
        mut event_loop: EventLoop,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Starting MQTT event loop supervisor");
        let mut failures = 0u32;
        let mut was_connected = false;

        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping supervisor");
                        break;
                    }
                }
                polled = event_loop.poll() => match polled {
                    Ok(event) => {
                        let route = route_mqtt_event(&event);
                        if !shared.process_event_route(route, &mut failures, &mut was_connected) {
                            break;
                        }
                    }
                    Err(e) => {
                        if shared.closing.load(Ordering::SeqCst) {
                            break;
                        }

                        let reason = e.to_string();
                        error!(error = %reason, "MQTT event loop error");
                        shared.transition(ConnectionEvent::NetworkError(reason.clone()));
                        shared.lose_connection(&reason, &mut was_connected);

                        let shutdown_requested = *shutdown_rx.borrow();
                        match HealthMonitor::should_attempt_reconnection(
                            failures,
                            &shared.reconnect,
                            shutdown_requested,
                        ) {
                            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                                failures = attempt;
                                shared.transition(ConnectionEvent::ReconnectionStarted(attempt));
                                if let Some(observer) = shared.observer() {
                                    observer.on_reconnecting(attempt);
                                }
                                if !Self::interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                                    break;
                                }
                            }
                            ReconnectionDecision::AbortShutdownRequested => break,
                            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                                shared.transition(ConnectionEvent::PermanentFailure(format!(
                                    "Gave up after {failures} reconnection attempts"
                                )));
                                break;
                            }
                        }
                    }
                }
            }
        }

        shared.acks.on_connection_lost("Transport stopped");
        info!("MQTT event loop supervisor stopped");
    }

    fn check_connection_state(&self) -> Result<(), TransportError> {
        let state = self.state_rx.borrow().clone();
        if !HealthMonitor::can_issue_requests(&state) {
            return Err(TransportError::NotConnected { state });
        }
        Ok(())
    }

    async fn await_ack(
        receiver: tokio::sync::oneshot::Receiver<Result<(), TransportError>>,
    ) -> Result<(), TransportError> {
        receiver.await.unwrap_or(Err(TransportError::AckDropped))
    }
}

fn request_error(e: rumqttc::v5::ClientError) -> TransportError {
    TransportError::Request(Box::new(e))
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let state_rx = self.state_rx.clone();
        self.ensure_supervisor()?;
        Self::wait_for_connection_confirmation(state_rx, self.connect_timeout).await
    }

    async fn disconnect(&self, wait: Duration) -> Result<(), TransportError> {
        self.shared.closing.store(true, Ordering::SeqCst);
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut result = Ok(());
        if let Some(mut handle) = handle {
            if self.is_connected() {
                if let Err(e) = self.shared.client.try_disconnect() {
                    result = Err(request_error(e));
                }
            }

            // give the supervisor time to write DISCONNECT
            match tokio::time::timeout(wait, &mut handle).await {
                Ok(Ok(())) => debug!("Supervisor shut down gracefully"),
                Ok(Err(e)) => warn!(error = %e, "Supervisor task ended with error"),
                Err(_) => {
                    warn!("Supervisor did not stop in time, aborting");
                    let _ = self.shutdown_tx.send(true);
                    handle.abort();
                }
            }
        }

        self.shared.transition(ConnectionEvent::PermanentFailure(
            "Client disconnected".to_string(),
        ));
        info!("MQTT transport disconnected");
        result
    }

    fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        *self
            .shared
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), TransportError> {
        self.check_connection_state()?;

        // route first so retained messages arriving with the SubAck are seen
        self.shared.router.insert(topic, handler.clone());
        let client = &self.shared.client;
        let result = match self.shared.acks.register(AckKind::Subscribe, || {
            client.try_subscribe(topic.to_string(), qos).map_err(request_error)
        }) {
            Ok(ack) => Self::await_ack(ack).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => debug!(topic = %topic, ?qos, "Subscribed"),
            Err(e) => {
                self.shared.router.remove_if_same(topic, &handler);
                warn!(topic = %topic, error = %e, "Subscribe failed");
            }
        }
        result
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.check_connection_state()?;

        self.shared.router.remove(topic);
        let client = &self.shared.client;
        let ack = self.shared.acks.register(AckKind::Unsubscribe, || {
            client.try_unsubscribe(topic.to_string()).map_err(request_error)
        })?;
        Self::await_ack(ack).await?;

        debug!(topic = %topic, "Unsubscribed");
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.check_connection_state()?;

        self.shared
            .client
            .publish(topic.to_string(), qos, retained, payload)
            .await
            .map_err(request_error)
    }

    fn broker_host(&self) -> String {
        self.host.clone()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
