//! Normalized in-memory representation of one received message

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub const META_QOS: &str = "qos";
pub const META_RETAINED: &str = "retained";
pub const META_MESSAGE_ID: &str = "message_id";
pub const META_DUPLICATE: &str = "duplicate";

/// Acknowledgement capability attached to manually-acked deliveries.
/// `commit` must be idempotent.
pub trait Committer: Send + Sync {
    fn commit(&self);
}

/// A message received from the broker
///
/// Built by the handler factory on the transport's I/O task and moved to
/// whichever caller receives it. Never mutated after construction.
#[derive(Clone)]
pub struct Envelope {
    topic: String,
    payload: Bytes,
    metadata: HashMap<String, String>,
    committer: Option<Arc<dyn Committer>>,
    correlation_id: Uuid,
}

impl Envelope {
    pub fn new(
        topic: String,
        payload: Bytes,
        metadata: HashMap<String, String>,
        committer: Option<Arc<dyn Committer>>,
    ) -> Self {
        Self {
            topic,
            payload,
            metadata,
            committer,
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Payload as UTF-8, lossily
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn requires_commit(&self) -> bool {
        self.committer.is_some()
    }

    /// Acknowledge the delivery. No-op when the broker acknowledged it already.
    pub fn commit(&self) {
        if let Some(committer) = &self.committer {
            committer.commit();
        }
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("topic", &self.topic)
            .field("payload", &self.payload)
            .field("metadata", &self.metadata)
            .field("correlation_id", &self.correlation_id)
            .field("requires_commit", &self.requires_commit())
            .finish()
    }
}
