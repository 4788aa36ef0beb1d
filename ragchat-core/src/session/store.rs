//! Session data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The active conversation identity held by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Opaque token assigned by the backend
    pub id: String,
    /// Session creation time
    pub created_at: DateTime<Utc>,
    /// Last time the session was used
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Create a session record stamped with the current time
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Mark the session as used
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

impl From<SessionInfo> for Session {
    fn from(info: SessionInfo) -> Self {
        Self {
            id: info.id,
            created_at: info.created_at,
            last_activity: info.last_activity,
        }
    }
}

/// Backend view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u64,
}

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Delivery state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamState {
    /// Settled message with no stream attached
    #[default]
    None,
    /// User turn sent, waiting for the backend to start answering
    PendingAck,
    /// Assistant content is still arriving
    Streaming,
    /// Assistant content is final
    Complete,
    /// Stream ended with a backend error
    Failed,
}

impl StreamState {
    /// Whether content may no longer change
    pub fn is_final(&self) -> bool {
        matches!(self, StreamState::Complete | StreamState::Failed)
    }
}

/// A chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Backend id for assistant messages, local UUID for the optimistic echo
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub stream_state: StreamState,
}

impl ChatMessage {
    /// Create a locally generated user message
    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            stream_state: StreamState::PendingAck,
        }
    }

    /// Create an assistant message with the given backend id
    pub fn assistant(
        id: impl Into<String>,
        session_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            stream_state: StreamState::Streaming,
        }
    }

    /// Set the stream state
    pub fn with_state(mut self, state: StreamState) -> Self {
        self.stream_state = state;
        self
    }

    /// Normalize a message loaded from history: it is always settled
    pub fn settled(mut self) -> Self {
        self.stream_state = match self.role {
            Role::User => StreamState::None,
            Role::Assistant => StreamState::Complete,
        };
        self
    }
}

/// A retrieved document that supported the latest answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceResult {
    pub article_id: String,
    #[serde(default)]
    pub content: String,
    /// Relevance in `[0, 1]`
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub metadata: SourceMetadata,
}

impl SourceResult {
    /// Clamp the score into `[0, 1]`; NaN becomes 0
    pub fn normalized(mut self) -> Self {
        self.score = if self.score.is_nan() {
            0.0
        } else {
            self.score.clamp(0.0, 1.0)
        };
        self
    }
}

/// Descriptive fields attached to a source document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    /// Backend-specific extras
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_is_pending() {
        let msg = ChatMessage::user("s1", "hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.stream_state, StreamState::PendingAck);
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn test_history_message_parses_camel_case() {
        let raw = r#"{
            "id": "m1",
            "sessionId": "s1",
            "role": "assistant",
            "content": "Hi",
            "timestamp": "2024-05-01T10:00:00.000Z"
        }"#;
        let msg: ChatMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.session_id, "s1");
        assert_eq!(msg.stream_state, StreamState::None);
        assert_eq!(msg.settled().stream_state, StreamState::Complete);
    }

    #[test]
    fn test_source_metadata_keeps_extras() {
        let raw = r#"{
            "articleId": "a1",
            "content": "text",
            "score": 1.7,
            "metadata": {"title": "T", "publishedAt": "2024-01-01", "author": "x"}
        }"#;
        let source: SourceResult = serde_json::from_str(raw).unwrap();
        let source = source.normalized();
        assert_eq!(source.score, 1.0);
        assert_eq!(source.metadata.title.as_deref(), Some("T"));
        assert_eq!(source.metadata.published_at.as_deref(), Some("2024-01-01"));
        assert_eq!(source.metadata.extra.get("author"), Some(&serde_json::json!("x")));
    }

    #[test]
    fn test_stream_state_serializes_kebab_case() {
        let value = serde_json::to_value(StreamState::PendingAck).unwrap();
        assert_eq!(value, serde_json::json!("pending-ack"));
        assert!(StreamState::Failed.is_final());
        assert!(!StreamState::Streaming.is_final());
    }
}
