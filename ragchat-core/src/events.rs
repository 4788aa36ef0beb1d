//! Push-event protocol carried over the event connection
//!
//! Every websocket frame is a JSON envelope `{"event": <name>, "data": <payload>}`.
//! Server payloads may carry an optional `sessionId`, which lets the client
//! drop events that belong to a superseded session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::SourceResult;

/// Client -> server
pub const JOIN_SESSION: &str = "join-session";
pub const LEAVE_SESSION: &str = "leave-session";
pub const SEND_MESSAGE_STREAM: &str = "send-message-stream";

/// Server -> client
pub const STREAM_SESSION: &str = "stream-session";
pub const STREAM_USER_MESSAGE: &str = "stream-user-message";
pub const STREAM_SOURCES: &str = "stream-sources";
pub const STREAM_START: &str = "stream-start";
pub const STREAM_CHUNK: &str = "stream-chunk";
pub const STREAM_COMPLETE: &str = "stream-complete";
pub const STREAM_ERROR: &str = "stream-error";

/// All server event names the engine subscribes to
pub const SERVER_EVENTS: [&str; 7] = [
    STREAM_SESSION,
    STREAM_USER_MESSAGE,
    STREAM_SOURCES,
    STREAM_START,
    STREAM_CHUNK,
    STREAM_COMPLETE,
    STREAM_ERROR,
];

/// Wire frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Encode as a text frame
    pub fn to_text(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a text frame
    pub fn from_text(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAssigned {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessageAck {
    pub message_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcesUpdate {
    #[serde(default)]
    pub sources: Vec<SourceResult>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub message_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub message_id: String,
    #[serde(default)]
    pub content: String,
    /// Optional 0-based chunk index within the message
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamComplete {
    pub message_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFailure {
    #[serde(default = "default_stream_error")]
    pub error: String,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(default)]
    pub session_id: Option<String>,
}

fn default_stream_error() -> String {
    "Streaming failed".to_string()
}

impl StreamFailure {
    /// Details flattened to text
    pub fn detail_text(&self) -> Option<String> {
        match &self.details {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// A decoded server push event
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Session(SessionAssigned),
    UserMessage(UserMessageAck),
    Sources(SourcesUpdate),
    Start(StreamStart),
    Chunk(StreamChunk),
    Complete(StreamComplete),
    Error(StreamFailure),
}

impl ServerEvent {
    /// Decode a named payload. Unknown names yield `Ok(None)`.
    pub fn parse(name: &str, data: &Value) -> crate::Result<Option<Self>> {
        let event = match name {
            STREAM_SESSION => ServerEvent::Session(decode(data)?),
            STREAM_USER_MESSAGE => ServerEvent::UserMessage(decode(data)?),
            STREAM_SOURCES => ServerEvent::Sources(decode(data)?),
            STREAM_START => ServerEvent::Start(decode(data)?),
            STREAM_CHUNK => ServerEvent::Chunk(decode(data)?),
            STREAM_COMPLETE => ServerEvent::Complete(decode(data)?),
            STREAM_ERROR => ServerEvent::Error(decode(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Session id declared by the payload, if any
    pub fn declared_session(&self) -> Option<&str> {
        match self {
            ServerEvent::Session(p) => Some(p.session_id.as_str()),
            ServerEvent::UserMessage(p) => p.session_id.as_deref(),
            ServerEvent::Sources(p) => p.session_id.as_deref(),
            ServerEvent::Start(p) => p.session_id.as_deref(),
            ServerEvent::Chunk(p) => p.session_id.as_deref(),
            ServerEvent::Complete(p) => p.session_id.as_deref(),
            ServerEvent::Error(p) => p.session_id.as_deref(),
        }
    }

    /// Event name on the wire
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Session(_) => STREAM_SESSION,
            ServerEvent::UserMessage(_) => STREAM_USER_MESSAGE,
            ServerEvent::Sources(_) => STREAM_SOURCES,
            ServerEvent::Start(_) => STREAM_START,
            ServerEvent::Chunk(_) => STREAM_CHUNK,
            ServerEvent::Complete(_) => STREAM_COMPLETE,
            ServerEvent::Error(_) => STREAM_ERROR,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: &Value) -> crate::Result<T> {
    Ok(serde_json::from_value(data.clone())?)
}

/// A client command sent over the event connection
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    JoinSession(String),
    LeaveSession(String),
    SendMessageStream {
        message: String,
        session_id: Option<String>,
    },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::JoinSession(_) => JOIN_SESSION,
            ClientCommand::LeaveSession(_) => LEAVE_SESSION,
            ClientCommand::SendMessageStream { .. } => SEND_MESSAGE_STREAM,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            ClientCommand::JoinSession(id) | ClientCommand::LeaveSession(id) => {
                Value::String(id.clone())
            }
            ClientCommand::SendMessageStream {
                message,
                session_id,
            } => {
                let mut payload = serde_json::json!({ "message": message });
                if let Some(id) = session_id {
                    payload["sessionId"] = Value::String(id.clone());
                }
                payload
            }
        }
    }

    pub fn into_envelope(self) -> Envelope {
        Envelope::new(self.name(), self.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_chunk_with_optional_fields() {
        let event = ServerEvent::parse(STREAM_CHUNK, &json!({"messageId": "m1", "content": "pon"}))
            .unwrap()
            .unwrap();
        match event {
            ServerEvent::Chunk(chunk) => {
                assert_eq!(chunk.message_id, "m1");
                assert_eq!(chunk.content, "pon");
                assert_eq!(chunk.seq, None);
                assert_eq!(chunk.session_id, None);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_event_is_none() {
        assert!(ServerEvent::parse("typing", &json!({})).unwrap().is_none());
    }

    #[test]
    fn test_parse_malformed_payload_is_error() {
        assert!(ServerEvent::parse(STREAM_START, &json!({"id": 3})).is_err());
    }

    #[test]
    fn test_stream_error_details_text() {
        let event = ServerEvent::parse(
            STREAM_ERROR,
            &json!({"error": "boom", "details": "upstream timeout", "sessionId": "s1"}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.declared_session(), Some("s1"));
        if let ServerEvent::Error(failure) = event {
            assert_eq!(failure.detail_text().as_deref(), Some("upstream timeout"));
        }
    }

    #[test]
    fn test_send_command_envelope() {
        let text = ClientCommand::SendMessageStream {
            message: "ping".to_string(),
            session_id: Some("s1".to_string()),
        }
        .into_envelope()
        .to_text()
        .unwrap();
        let envelope = Envelope::from_text(&text).unwrap();
        assert_eq!(envelope.event, SEND_MESSAGE_STREAM);
        assert_eq!(envelope.data, json!({"message": "ping", "sessionId": "s1"}));
    }

    #[test]
    fn test_join_payload_is_bare_id() {
        let cmd = ClientCommand::JoinSession("s9".to_string());
        assert_eq!(cmd.payload(), json!("s9"));
    }
}
