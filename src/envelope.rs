//! Canonical message record
//!
//! One `Envelope` is produced at ingress and flows unmodified through the
//! broker and every socket it is delivered on. The client wire form is the
//! JSON object described in the protocol docs; the broker wire form wraps it
//! in a [`BrokerFrame`] that additionally carries the origin instance and the
//! skip set, neither of which is ever exposed to clients.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FabricError;

/// Identifier of one server instance, generated once at startup (or taken
/// from `INSTANCE_ID`) and injected everywhere it is needed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh instance id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access tiers recognised by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Guest,
    User,
    Admin,
}

impl AccessLevel {
    pub fn is_admin(self) -> bool {
        matches!(self, AccessLevel::Admin)
    }
}

/// Authenticated identity attached to a connection at upgrade time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub display_name: String,
    pub access_level: AccessLevel,
}

/// Sender block embedded in outbound envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeSender {
    pub id: String,
    pub name: String,
}

impl From<&Principal> for EnvelopeSender {
    fn from(principal: &Principal) -> Self {
        Self {
            id: principal.user_id.clone(),
            name: principal.display_name.clone(),
        }
    }
}

/// Envelope metadata. Currently only a trace id for cross-instance
/// correlation of a single fan-out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Uuid>,
}

/// The canonical message record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    #[serde(rename = "ns")]
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    pub event: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<EnvelopeSender>,
    /// Server-stamped unix milliseconds.
    #[serde(rename = "ts")]
    pub timestamp: i64,
    #[serde(default)]
    pub meta: EnvelopeMeta,
}

impl Envelope {
    /// Build a new envelope with a fresh id and a server timestamp.
    pub fn new(namespace: impl Into<String>, event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            room: None,
            event: event.into(),
            payload,
            sender: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            meta: EnvelopeMeta::default(),
        }
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn with_sender(mut self, principal: &Principal) -> Self {
        self.sender = Some(EnvelopeSender::from(principal));
        self
    }

    pub fn with_trace(mut self, trace: Uuid) -> Self {
        self.meta.trace = Some(trace);
        self
    }

    /// Serialise to the client wire form.
    pub fn to_wire(&self) -> Result<String, FabricError> {
        serde_json::to_string(self).map_err(|e| FabricError::Protocol(format!("envelope encode: {e}")))
    }
}

/// One frame received from a client: `{"event": "...", "payload": ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl InboundFrame {
    pub fn parse(raw: &str) -> Result<Self, FabricError> {
        serde_json::from_str(raw).map_err(|_| FabricError::Protocol("invalid frame".into()))
    }
}

/// Broker transit form: the envelope plus routing data that never reaches a
/// client socket. Connection ids are uuids, so the skip set stays meaningful
/// on every instance it lands on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerFrame {
    pub origin: InstanceId,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub except: HashSet<Uuid>,
    pub envelope: Envelope,
}

impl BrokerFrame {
    pub fn new(origin: InstanceId, envelope: Envelope) -> Self {
        Self {
            origin,
            except: HashSet::new(),
            envelope,
        }
    }

    pub fn with_except(mut self, except: HashSet<Uuid>) -> Self {
        self.except = except;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, FabricError> {
        serde_json::to_vec(self).map_err(|e| FabricError::Broker(format!("frame encode: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FabricError> {
        serde_json::from_slice(bytes).map_err(|e| FabricError::Broker(format!("frame decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_uses_short_field_names() {
        let envelope = Envelope::new("chat", "chat:message_new", serde_json::json!({"text": "hi"}))
            .with_room("general");
        let wire = envelope.to_wire().unwrap();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();

        assert_eq!(value["ns"], "chat");
        assert_eq!(value["room"], "general");
        assert_eq!(value["event"], "chat:message_new");
        assert!(value["ts"].is_i64());
        // Internal routing data never leaks to the client form
        assert!(value.get("origin").is_none());
        assert!(value.get("except").is_none());
    }

    #[test]
    fn sender_is_omitted_when_absent() {
        let envelope = Envelope::new("chat", "sys:connected", serde_json::json!({}));
        let wire = envelope.to_wire().unwrap();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert!(value.get("sender").is_none());
    }

    #[test]
    fn broker_frame_round_trips_origin_and_except() {
        let origin = InstanceId::new("instance-a");
        let skip = Uuid::new_v4();
        let envelope = Envelope::new("chat", "chat:message_new", serde_json::json!({"text": "hi"}));
        let id = envelope.id;

        let mut except = HashSet::new();
        except.insert(skip);
        let frame = BrokerFrame::new(origin.clone(), envelope).with_except(except);

        let decoded = BrokerFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.origin, origin);
        assert!(decoded.except.contains(&skip));
        assert_eq!(decoded.envelope.id, id);
    }

    #[test]
    fn inbound_frame_defaults_payload_to_null() {
        let frame = InboundFrame::parse(r#"{"event":"who_am_i"}"#).unwrap();
        assert_eq!(frame.event, "who_am_i");
        assert!(frame.payload.is_null());
    }

    #[test]
    fn inbound_frame_rejects_non_json() {
        assert!(InboundFrame::parse("not json").is_err());
    }
}
