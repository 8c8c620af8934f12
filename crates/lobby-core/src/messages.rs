//! Event types exchanged over the lobby connection.
//!
//! Every frame is an [`Envelope`] carrying an event tag and a JSON payload.
//! Payload `data` fields are opaque to the hub: they are forwarded between
//! peers without inspection.

use crate::codec::{frame_decode, frame_encode};
use crate::error::{LobbyError, LobbyResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Event tags, as they appear on the wire.
pub mod tags {
    pub const CLIENTS: &str = "clients";
    pub const MESSAGE: &str = "message";
    pub const CREATE_SERVER: &str = "create_server";
    pub const REMOVE_SERVER: &str = "remove_server";
    pub const CONNECT_ERROR: &str = "connect_error";
}

/// Verified subject claim naming a connected party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self(subject.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Externally visible projection of a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub identity: Identity,
    pub username: String,
}

/// Wire envelope: `{"event": <tag>, "data": <payload>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    fn wrap<T: Serialize>(event: &str, payload: &T) -> LobbyResult<Self> {
        Ok(Self {
            event: event.to_string(),
            data: serde_json::to_value(payload)?,
        })
    }

    fn payload<T: DeserializeOwned>(self) -> LobbyResult<T> {
        let event = self.event;
        serde_json::from_value(self.data)
            .map_err(|e| LobbyError::InvalidMessage(format!("bad `{event}` payload: {e}")))
    }
}

// ── Client → server ──────────────────────────────────────────────────────────

/// Route request: deliver `data` to the peer named by `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub to: Identity,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Advertise a service resource owned by the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateServerPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Withdraw the sender's service resource of the given type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveServerPayload {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Events a client sends to the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Message(MessagePayload),
    CreateServer(CreateServerPayload),
    RemoveServer(RemoveServerPayload),
}

impl ClientEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            ClientEvent::Message(_) => tags::MESSAGE,
            ClientEvent::CreateServer(_) => tags::CREATE_SERVER,
            ClientEvent::RemoveServer(_) => tags::REMOVE_SERVER,
        }
    }

    pub fn to_envelope(&self) -> LobbyResult<Envelope> {
        match self {
            ClientEvent::Message(p) => Envelope::wrap(self.tag(), p),
            ClientEvent::CreateServer(p) => Envelope::wrap(self.tag(), p),
            ClientEvent::RemoveServer(p) => Envelope::wrap(self.tag(), p),
        }
    }

    /// Convert an envelope into a typed event.
    ///
    /// Returns `Ok(None)` for tags this side does not handle.
    pub fn from_envelope(envelope: Envelope) -> LobbyResult<Option<Self>> {
        let event = match envelope.event.as_str() {
            tags::MESSAGE => ClientEvent::Message(envelope.payload()?),
            tags::CREATE_SERVER => ClientEvent::CreateServer(envelope.payload()?),
            tags::REMOVE_SERVER => ClientEvent::RemoveServer(envelope.payload()?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn encode(&self) -> LobbyResult<String> {
        frame_encode(&self.to_envelope()?)
    }

    pub fn decode(text: &str) -> LobbyResult<Option<Self>> {
        Self::from_envelope(frame_decode(text)?)
    }
}

// ── Server → client ──────────────────────────────────────────────────────────

/// A routed message as seen by its recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredMessage {
    pub from: Identity,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Sent once before the hub closes a connection that failed admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectErrorPayload {
    pub message: String,
    pub reason: String,
}

/// Events the hub pushes to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Full replacement of the receiver's peer view, self excluded.
    Clients(Vec<PeerInfo>),
    Message(DeliveredMessage),
    ConnectError(ConnectErrorPayload),
}

impl ServerEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            ServerEvent::Clients(_) => tags::CLIENTS,
            ServerEvent::Message(_) => tags::MESSAGE,
            ServerEvent::ConnectError(_) => tags::CONNECT_ERROR,
        }
    }

    pub fn to_envelope(&self) -> LobbyResult<Envelope> {
        match self {
            ServerEvent::Clients(peers) => Envelope::wrap(self.tag(), peers),
            ServerEvent::Message(m) => Envelope::wrap(self.tag(), m),
            ServerEvent::ConnectError(e) => Envelope::wrap(self.tag(), e),
        }
    }

    /// Convert an envelope into a typed event; unknown tags yield `Ok(None)`.
    pub fn from_envelope(envelope: Envelope) -> LobbyResult<Option<Self>> {
        let event = match envelope.event.as_str() {
            tags::CLIENTS => ServerEvent::Clients(envelope.payload()?),
            tags::MESSAGE => ServerEvent::Message(envelope.payload()?),
            tags::CONNECT_ERROR => ServerEvent::ConnectError(envelope.payload()?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn encode(&self) -> LobbyResult<String> {
        frame_encode(&self.to_envelope()?)
    }

    pub fn decode(text: &str) -> LobbyResult<Option<Self>> {
        Self::from_envelope(frame_decode(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_message_request() {
        let text = r#"{"event":"message","data":{"to":"u2","type":"TEXT","data":"hi"}}"#;
        let event = ClientEvent::decode(text).unwrap().unwrap();
        assert_eq!(
            event,
            ClientEvent::Message(MessagePayload {
                to: Identity::from("u2"),
                kind: "TEXT".into(),
                data: json!("hi"),
            })
        );
    }

    #[test]
    fn decode_create_server_without_data() {
        let text = r#"{"event":"create_server","data":{"type":"game"}}"#;
        let event = ClientEvent::decode(text).unwrap().unwrap();
        match event {
            ClientEvent::CreateServer(p) => {
                assert_eq!(p.kind, "game");
                assert!(p.data.is_null());
            }
            other => panic!("expected CreateServer, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_ignored() {
        let text = r#"{"event":"join_room","data":{"room":"a"}}"#;
        assert!(ClientEvent::decode(text).unwrap().is_none());
    }

    #[test]
    fn missing_recipient_is_invalid() {
        let text = r#"{"event":"message","data":{"type":"TEXT"}}"#;
        assert!(matches!(
            ClientEvent::decode(text),
            Err(LobbyError::InvalidMessage(_))
        ));
    }

    #[test]
    fn delivered_message_wire_shape() {
        let event = ServerEvent::Message(DeliveredMessage {
            from: Identity::from("u1"),
            kind: "TEXT".into(),
            data: json!("hi"),
        });
        let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"event": "message", "data": {"from": "u1", "type": "TEXT", "data": "hi"}})
        );
    }

    #[test]
    fn clients_wire_shape() {
        let event = ServerEvent::Clients(vec![PeerInfo {
            identity: Identity::from("u1"),
            username: "alice".into(),
        }]);
        let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"event": "clients", "data": [{"identity": "u1", "username": "alice"}]})
        );
    }

    #[test]
    fn empty_clients_list_survives_encoding() {
        let text = ServerEvent::Clients(Vec::new()).encode().unwrap();
        assert_eq!(
            ServerEvent::decode(&text).unwrap(),
            Some(ServerEvent::Clients(Vec::new()))
        );
    }

    #[test]
    fn structured_payload_is_passed_through() {
        let data = json!({"sdp": "v=0", "candidates": [1, 2, 3]});
        let event = ClientEvent::Message(MessagePayload {
            to: Identity::from("peer"),
            kind: "OFFER".into(),
            data: data.clone(),
        });
        match ClientEvent::decode(&event.encode().unwrap()).unwrap() {
            Some(ClientEvent::Message(p)) => assert_eq!(p.data, data),
            other => panic!("expected Message, got {other:?}"),
        }
    }
}
