//! Event routing for the MQTT transport
//!
//! [`route_mqtt_event`] classifies each event-loop event, [`HandlerRouter`]
//! maps topic filters to handlers and [`AckTracker`] pairs subscribe and
//! unsubscribe requests with their acknowledgements.

use crate::transport::{MessageHandler, TransportError};
use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode, Packet, Publish, SubscribeReasonCode, UnsubAckReason,
};
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::sync::oneshot;

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged, ready to publish and subscribe
    ConnectionAcknowledged,
    /// Broker refused the connection
    ConnectionRefused(String),
    MessageReceived(Publish),
    /// Broker initiated disconnect
    Disconnected,
    SubscriptionAcknowledged { packet_id: u16, failures: Vec<String> },
    UnsubscriptionAcknowledged { packet_id: u16, failures: Vec<String> },
    /// Subscribe packet written, packet id assigned
    SubscribeSent(u16),
    UnsubscribeSent(u16),
    /// Our DISCONNECT packet was written
    DisconnectSent,
    /// PingResp, PubAck and the like
    InfrastructureEvent,
}

/// Classify one event-loop event
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(Packet::ConnAck(connack)) => match &connack.code {
            ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
            code => EventRoute::ConnectionRefused(format!("{code:?}")),
        },
        Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived(publish.clone()),
        Event::Incoming(Packet::Disconnect(_)) => EventRoute::Disconnected,
        Event::Incoming(Packet::SubAck(suback)) => EventRoute::SubscriptionAcknowledged {
            packet_id: suback.pkid,
            failures: suback
                .return_codes
                .iter()
                .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                .map(|code| format!("{code:?}"))
                .collect(),
        },
        Event::Incoming(Packet::UnsubAck(unsuback)) => EventRoute::UnsubscriptionAcknowledged {
            packet_id: unsuback.pkid,
            failures: unsuback
                .reasons
                .iter()
                .filter(|reason| !matches!(reason, UnsubAckReason::Success))
                .map(|reason| format!("{reason:?}"))
                .collect(),
        },
        Event::Outgoing(Outgoing::Subscribe(pkid)) => EventRoute::SubscribeSent(*pkid),
        Event::Outgoing(Outgoing::Unsubscribe(pkid)) => EventRoute::UnsubscribeSent(*pkid),
        Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
        _ => EventRoute::InfrastructureEvent,
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // wildcards never match topics starting with '$'
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// One handler per topic filter
#[derive(Default)]
pub struct HandlerRouter {
    routes: RwLock<HashMap<String, MessageHandler>>,
}

impl HandlerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `filter`, replacing any previous one
    pub fn insert(&self, filter: &str, handler: MessageHandler) -> Option<MessageHandler> {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(filter.to_string(), handler)
    }

    pub fn remove(&self, filter: &str) -> Option<MessageHandler> {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(filter)
    }

    /// Remove the route only if it still points at `handler`
    pub fn remove_if_same(&self, filter: &str, handler: &MessageHandler) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if routes
            .get(filter)
            .is_some_and(|current| std::sync::Arc::ptr_eq(current, handler))
        {
            routes.remove(filter);
        }
    }

    /// Handlers whose filter matches `topic`, exact match first
    pub fn matching(&self, topic: &str) -> Vec<MessageHandler> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        let mut handlers = Vec::new();
        if let Some(exact) = routes.get(topic) {
            handlers.push(exact.clone());
        }
        handlers.extend(
            routes
                .iter()
                .filter(|(filter, _)| filter.as_str() != topic && topic_matches(filter, topic))
                .map(|(_, handler)| handler.clone()),
        );
        handlers
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type AckSender = oneshot::Sender<Result<(), TransportError>>;

#[derive(Default)]
struct AckQueue {
    /// Requests handed to the client, not yet written to the socket
    pending: VecDeque<AckSender>,
    /// Written requests keyed by packet id
    inflight: HashMap<u16, AckSender>,
}

impl AckQueue {
    fn bind(&mut self, packet_id: u16) {
        if let Some(sender) = self.pending.pop_front() {
            self.inflight.insert(packet_id, sender);
        }
    }

    fn resolve(&mut self, packet_id: u16, failures: Vec<String>) -> bool {
        let Some(sender) = self.inflight.remove(&packet_id) else {
            return false;
        };
        let result = if failures.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Rejected(failures.join(", ")))
        };
        let _ = sender.send(result);
        true
    }

    fn fail_inflight(&mut self, reason: &str) {
        for (_, sender) in self.inflight.drain() {
            let _ = sender.send(Err(TransportError::ConnectionFailed(reason.to_string())));
        }
    }
}

/// Which acknowledgement a request waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Subscribe,
    Unsubscribe,
}

/// Pairs requests with SubAck/UnsubAck.
///
/// `rumqttc` assigns packet ids when it writes a request, in the order
/// requests were queued. Callers register and queue under the same lock
/// (see [`AckTracker::register`]), so the oldest pending waiter always owns
/// the next outgoing packet id.
#[derive(Default)]
pub struct AckTracker {
    subscribe: Mutex<AckQueue>,
    unsubscribe: Mutex<AckQueue>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, kind: AckKind) -> std::sync::MutexGuard<'_, AckQueue> {
        let queue = match kind {
            AckKind::Subscribe => &self.subscribe,
            AckKind::Unsubscribe => &self.unsubscribe,
        };
        queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a waiter and run `send` while the queue is locked.
    /// If `send` fails the waiter is withdrawn.
    pub fn register<F>(
        &self,
        kind: AckKind,
        send: F,
    ) -> Result<oneshot::Receiver<Result<(), TransportError>>, TransportError>
    where
        F: FnOnce() -> Result<(), TransportError>,
    {
        let (tx, rx) = oneshot::channel();
        let mut queue = self.queue(kind);
        send()?;
        queue.pending.push_back(tx);
        Ok(rx)
    }

    pub fn on_sent(&self, kind: AckKind, packet_id: u16) {
        self.queue(kind).bind(packet_id);
    }

    /// Returns `false` for acknowledgements nobody waits for
    pub fn on_ack(&self, kind: AckKind, packet_id: u16, failures: Vec<String>) -> bool {
        self.queue(kind).resolve(packet_id, failures)
    }

    /// Fail written requests; queued ones are resent by the client after
    /// reconnecting and stay pending
    pub fn on_connection_lost(&self, reason: &str) {
        self.queue(AckKind::Subscribe).fail_inflight(reason);
        self.queue(AckKind::Unsubscribe).fail_inflight(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RawMessage;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{ConnAck, SubAck};
    use rumqttc::v5::mqttbytes::QoS;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_topic_matches() {
        let cases = [
            ("sensors/temp", "sensors/temp", true),
            ("sensors/temp", "sensors/humidity", false),
            ("sensors/+", "sensors/temp", true),
            ("sensors/+", "sensors/temp/raw", false),
            ("sensors/+/raw", "sensors/temp/raw", true),
            ("sensors/#", "sensors", true),
            ("sensors/#", "sensors/temp/raw", true),
            ("#", "anything/at/all", true),
            ("#", "$SYS/uptime", false),
            ("+/uptime", "$SYS/uptime", false),
            ("$SYS/#", "$SYS/uptime", true),
            ("a/b", "a/b/c", false),
            ("a/b/c", "a/b", false),
        ];

        for (filter, topic, expected) in cases {
            assert_eq!(topic_matches(filter, topic), expected, "{filter} vs {topic}");
        }
    }

    #[test]
    fn test_route_connack_and_publish() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let publish = Publish::new("sensors/temp", QoS::AtLeastOnce, "21.5", None);
        match route_mqtt_event(&Event::Incoming(Packet::Publish(publish))) {
            EventRoute::MessageReceived(p) => assert_eq!(p.payload, Bytes::from_static(b"21.5")),
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[test]
    fn test_route_suback_collects_failures() {
        let suback = SubAck {
            pkid: 7,
            return_codes: vec![SubscribeReasonCode::NotAuthorized],
            properties: None,
        };

        match route_mqtt_event(&Event::Incoming(Packet::SubAck(suback))) {
            EventRoute::SubscriptionAcknowledged {
                packet_id,
                failures,
            } => {
                assert_eq!(packet_id, 7);
                assert_eq!(failures, vec!["NotAuthorized".to_string()]);
            }
            other => panic!("unexpected route: {other:?}"),
        }

        assert!(matches!(
            route_mqtt_event(&Event::Outgoing(Outgoing::Subscribe(7))),
            EventRoute::SubscribeSent(7)
        ));
        assert!(matches!(
            route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::InfrastructureEvent
        ));
    }

    #[test]
    fn test_router_dispatches_to_matching_filters() {
        let router = HandlerRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let handler: MessageHandler = Arc::new(move |_: RawMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        router.insert("sensors/+", handler.clone());
        router.insert("sensors/temp", handler.clone());
        router.insert("other", handler.clone());

        let matched = router.matching("sensors/temp");
        assert_eq!(matched.len(), 2);
        for h in matched {
            h(RawMessage::new("sensors/temp", "x"));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let replacement: MessageHandler = Arc::new(|_| {});
        router.insert("other", replacement);
        router.remove_if_same("other", &handler);
        assert_eq!(router.len(), 3, "replaced route must survive");

        router.remove("other");
        assert_eq!(router.len(), 2);
    }

    #[tokio::test]
    async fn test_ack_tracker_resolves_in_send_order() {
        let tracker = AckTracker::new();
        let first = tracker.register(AckKind::Subscribe, || Ok(())).unwrap();
        let second = tracker.register(AckKind::Subscribe, || Ok(())).unwrap();

        tracker.on_sent(AckKind::Subscribe, 11);
        tracker.on_sent(AckKind::Subscribe, 12);

        assert!(tracker.on_ack(AckKind::Subscribe, 12, vec!["QuotaExceeded".to_string()]));
        assert!(tracker.on_ack(AckKind::Subscribe, 11, vec![]));
        assert!(!tracker.on_ack(AckKind::Subscribe, 99, vec![]));

        assert!(first.await.unwrap().is_ok());
        assert!(matches!(
            second.await.unwrap(),
            Err(TransportError::Rejected(reason)) if reason == "QuotaExceeded"
        ));
    }

    #[tokio::test]
    async fn test_ack_tracker_withdraws_on_send_failure() {
        let tracker = AckTracker::new();
        let result = tracker.register(AckKind::Unsubscribe, || {
            Err(TransportError::ConnectionFailed("queue full".to_string()))
        });
        assert!(result.is_err());

        let waiter = tracker.register(AckKind::Unsubscribe, || Ok(())).unwrap();
        tracker.on_sent(AckKind::Unsubscribe, 3);
        tracker.on_ack(AckKind::Unsubscribe, 3, vec![]);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_ack_tracker_fails_inflight_on_connection_loss() {
        let tracker = AckTracker::new();
        let written = tracker.register(AckKind::Subscribe, || Ok(())).unwrap();
        let queued = tracker.register(AckKind::Subscribe, || Ok(())).unwrap();
        tracker.on_sent(AckKind::Subscribe, 1);

        tracker.on_connection_lost("reset by peer");

        assert!(matches!(
            written.await.unwrap(),
            Err(TransportError::ConnectionFailed(_))
        ));

        tracker.on_sent(AckKind::Subscribe, 1);
        tracker.on_ack(AckKind::Subscribe, 1, vec![]);
        assert!(queued.await.unwrap().is_ok());
    }
}
