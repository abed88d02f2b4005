//! Lifecycle events and the messages that announce them.

use chrono::{DateTime, Utc};
use common::{InstanceId, Payload};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The four things an action instance can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// The instance performed its effect.
    Started,
    /// The instance and everything it depended on completed.
    Succeeded,
    /// The instance, or one of its dependencies, failed.
    Failed,
    /// The instance is rolling back; its children must roll back too.
    Aborted,
}

impl LifecycleEvent {
    /// Returns the event name as used in topic names.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::Started => "Started",
            LifecycleEvent::Succeeded => "Succeeded",
            LifecycleEvent::Failed => "Failed",
            LifecycleEvent::Aborted => "Aborted",
        }
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Body of every message a coordinator publishes.
///
/// The instance id travels with each event so that receivers can correlate
/// it with their own per-instance keys. Only Started carries a payload: the
/// perform result, which becomes the input of child actions. It travels as
/// base64 text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleMessage {
    pub message_id: Uuid,
    pub action: String,
    pub event: LifecycleEvent,
    pub instance_id: InstanceId,
    #[serde(with = "base64_payload")]
    pub payload: Payload,
    pub published_at: DateTime<Utc>,
}

impl LifecycleMessage {
    pub fn new(
        action: impl Into<String>,
        event: LifecycleEvent,
        instance_id: InstanceId,
        payload: Payload,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            action: action.into(),
            event,
            instance_id,
            payload,
            published_at: Utc::now(),
        }
    }

    /// Serializes the message for publishing.
    pub fn encode(&self) -> Result<Payload, serde_json::Error> {
        Ok(Payload::from(serde_json::to_vec(self)?))
    }

    /// Parses a delivered message body.
    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

// Convenience constructors
impl LifecycleMessage {
    /// Started, carrying the perform result.
    pub fn started(action: impl Into<String>, instance_id: InstanceId, result: Payload) -> Self {
        Self::new(action, LifecycleEvent::Started, instance_id, result)
    }

    /// Succeeded, Failed or Aborted; these carry no payload.
    pub fn signal(action: impl Into<String>, event: LifecycleEvent, instance_id: InstanceId) -> Self {
        Self::new(action, event, instance_id, Payload::new())
    }
}

mod base64_payload {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use common::Payload;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Payload, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Payload, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Payload::from)
            .map_err(serde::de::Error::custom)
    }
}
