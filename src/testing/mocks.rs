//! In-memory broker for engine tests
//!
//! [`MockBroker`] implements [`BrokerTransport`] without a network. Tests
//! drive it directly: toggle connectivity, inject failures per topic, push
//! deliveries into installed handlers and replay connection lifecycle events
//! through the installed observer.

use crate::transport::mqtt::topic_matches;
use crate::transport::{
    BrokerTransport, ConnectionObserver, ConnectionState, MessageHandler, QoS, RawMessage,
    TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

/// A publish recorded by [`MockBroker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

#[derive(Default)]
struct BrokerState {
    connected: bool,
    handlers: HashMap<String, MessageHandler>,
    subscribe_calls: HashMap<String, usize>,
    unsubscribe_calls: HashMap<String, usize>,
    failing_subscribe: HashSet<String>,
    failing_unsubscribe: HashSet<String>,
    published: Vec<PublishedMessage>,
    connect_failures: u32,
    connect_attempts: u32,
}

/// Broker double with failure injection
pub struct MockBroker {
    state: Mutex<BrokerState>,
    observer: RwLock<Option<Arc<dyn ConnectionObserver>>>,
    subscribe_delay: Mutex<Duration>,
    host: String,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self::with_host("mock-broker")
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            observer: RwLock::new(None),
            subscribe_delay: Mutex::new(Duration::ZERO),
            host: host.into(),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // a panicking test thread must not poison every later assertion
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.observer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Flip connectivity without notifying the observer
    pub fn set_connected(&self, connected: bool) {
        self.state().connected = connected;
    }

    pub fn fail_subscribe(&self, topic: &str) {
        self.state().failing_subscribe.insert(topic.to_string());
    }

    pub fn fail_unsubscribe(&self, topic: &str) {
        self.state().failing_unsubscribe.insert(topic.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing_subscribe.clear();
        state.failing_unsubscribe.clear();
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.state().connect_failures = count;
    }

    /// Hold every subscribe for `delay` before answering
    pub fn set_subscribe_delay(&self, delay: Duration) {
        *self.subscribe_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Successful subscribes issued for `topic`
    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.state().subscribe_calls.get(topic).copied().unwrap_or(0)
    }

    pub fn unsubscribe_count(&self, topic: &str) -> usize {
        self.state().unsubscribe_calls.get(topic).copied().unwrap_or(0)
    }

    pub fn total_subscribe_calls(&self) -> usize {
        self.state().subscribe_calls.values().sum()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    pub fn has_handler(&self, topic: &str) -> bool {
        self.state().handlers.contains_key(topic)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    /// Push a message to every handler whose filter matches `topic`.
    /// Returns how many handlers were invoked.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let handlers: Vec<MessageHandler> = self
            .state()
            .handlers
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, handler)| handler.clone())
            .collect();

        // handlers may call back into the broker
        for handler in &handlers {
            handler(RawMessage::new(topic, payload.clone()));
        }
        handlers.len()
    }

    /// Drop the connection and notify the observer
    pub fn simulate_connection_lost(&self, reason: &str) {
        self.state().connected = false;
        if let Some(observer) = self.observer() {
            observer.on_connection_lost(reason);
        }
    }

    /// Come back online the way a reconnecting transport does
    pub fn simulate_reconnect(&self) {
        let observer = self.observer();
        if let Some(observer) = &observer {
            observer.on_reconnecting(1);
        }
        self.state().connected = true;
        if let Some(observer) = observer {
            observer.on_connected();
        }
    }

    /// Poll until `topic` has seen `expected` subscribes or `within` elapses
    pub async fn wait_for_subscribe_count(
        &self,
        topic: &str,
        expected: usize,
        within: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if self.subscribe_count(topic) >= expected {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn require_connected(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotConnected {
                state: self.connection_state(),
            })
        }
    }
}

#[async_trait]
impl BrokerTransport for MockBroker {
    async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state();
            state.connect_attempts += 1;
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(TransportError::ConnectionFailed(
                    "mock broker refused connection".to_string(),
                ));
            }
            state.connected = true;
        }

        if let Some(observer) = self.observer() {
            observer.on_connected();
        }
        Ok(())
    }

    async fn disconnect(&self, _wait: Duration) -> Result<(), TransportError> {
        self.state().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn connection_state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected("mock broker offline".to_string())
        }
    }

    fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        *self.observer.write().unwrap_or_else(|e| e.into_inner()) = Some(observer);
    }

    async fn subscribe(
        &self,
        topic: &str,
        _qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), TransportError> {
        let delay = *self.subscribe_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.require_connected()?;
        let mut state = self.state();
        if state.failing_subscribe.contains(topic) {
            return Err(TransportError::Rejected(format!(
                "subscribe to {topic} not authorized"
            )));
        }
        state.handlers.insert(topic.to_string(), handler);
        *state.subscribe_calls.entry(topic.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.require_connected()?;
        let mut state = self.state();
        state.handlers.remove(topic);
        *state.unsubscribe_calls.entry(topic.to_string()).or_insert(0) += 1;
        if state.failing_unsubscribe.contains(topic) {
            return Err(TransportError::Rejected(format!(
                "unsubscribe from {topic} refused"
            )));
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.require_connected()?;
        self.state().published.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
            qos,
            retained,
        });
        self.deliver(topic, payload);
        Ok(())
    }

    fn broker_host(&self) -> String {
        self.host.clone()
    }
}
