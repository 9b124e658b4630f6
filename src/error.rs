//! Error types for the subscription engine
//!
//! Transport failures are always wrapped together with the topic they concern.
//! Cancellation of a `subscribe` wait is not an error (it yields `Ok(None)`);
//! cancellation of a query is, and carries whatever was collected.

use crate::config::ConfigError;
use crate::transport::TransportError;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("MQTT client not connected")]
    NotConnected,

    #[error("Topic must not be empty")]
    EmptyTopic,

    #[error("Subscription to topic {topic} timed out")]
    SubscriptionTimeout { topic: String },

    #[error("Subscription to topic {topic} failed: {source}")]
    SubscriptionFailed {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Unsubscribe from topic {topic} failed: {source}")]
    UnsubscribeFailed {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Publish to topic {topic} failed: {source}")]
    PublishFailed {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Cancelled before subscription to topic {topic} completed")]
    Cancelled { topic: String },

    #[error("Query on topic {topic} cancelled after collecting {} bytes", .partial.len())]
    QueryCancelled { topic: String, partial: Bytes },

    #[error("Topic {topic} is bound to a callback subscription")]
    TopicBoundToCallback { topic: String },

    #[error("Topic {topic} already has an active subscription")]
    AlreadySubscribed { topic: String },

    #[error("Disconnect finished with {} error(s): {}", .0.len(), join_errors(.0))]
    Disconnect(Vec<PubSubError>),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PubSubError {
    /// Topic the error concerns, if any
    pub fn topic(&self) -> Option<&str> {
        match self {
            PubSubError::SubscriptionTimeout { topic }
            | PubSubError::SubscriptionFailed { topic, .. }
            | PubSubError::UnsubscribeFailed { topic, .. }
            | PubSubError::PublishFailed { topic, .. }
            | PubSubError::Cancelled { topic }
            | PubSubError::QueryCancelled { topic, .. }
            | PubSubError::TopicBoundToCallback { topic }
            | PubSubError::AlreadySubscribed { topic } => Some(topic),
            _ => None,
        }
    }

    /// Data collected by a query before it was cancelled
    pub fn partial_data(&self) -> Option<&Bytes> {
        match self {
            PubSubError::QueryCancelled { partial, .. } => Some(partial),
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            PubSubError::Cancelled { .. } | PubSubError::QueryCancelled { .. }
        )
    }
}

fn join_errors(errors: &[PubSubError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for engine operations
pub type PubSubResult<T> = Result<T, PubSubError>;
