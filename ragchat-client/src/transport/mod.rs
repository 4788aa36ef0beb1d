//! Request/response and push-event transports
//!
//! The engine only talks to the backend through the traits in this module:
//! [`Backend`] for request/response calls, [`EventChannel`] for the persistent
//! event connection, and [`IngestionSource`] for the optional status widget.
//! [`HttpBackend`] and [`SocketChannel`] are the production implementations.

pub mod http;
pub mod socket;

use async_trait::async_trait;
use ragchat_core::config::Config;
use ragchat_core::events::ClientCommand;
use ragchat_core::session::{ChatMessage, SessionInfo, SourceResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::ingestion::IngestionStatus;

pub use http::HttpBackend;
pub use socket::SocketChannel;

/// State of the persistent event connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Handler for a named push event
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Listener for connection state transitions
pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Response of `POST /chat/message`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReply {
    pub session_id: String,
    pub response: String,
    pub message_id: String,
    #[serde(default)]
    pub sources: Option<Vec<SourceResult>>,
}

/// Response of `GET /chat/history/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub count: u64,
}

/// Request/response surface of the backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Mint a new session and return its id
    async fn create_session(&self) -> ragchat_core::Result<String>;

    /// Ask whether the backend still recognizes a session id
    async fn validate_session(&self, session_id: &str) -> ragchat_core::Result<bool>;

    /// Fetch session metadata
    async fn session_info(&self, session_id: &str) -> ragchat_core::Result<SessionInfo>;

    /// Fetch up to `limit` messages of a session's history
    async fn get_history(&self, session_id: &str, limit: u32) -> ragchat_core::Result<History>;

    /// Remove the server-side history of a session
    async fn clear_session(&self, session_id: &str) -> ragchat_core::Result<()>;

    /// Delete a session on the backend
    async fn delete_session(&self, session_id: &str) -> ragchat_core::Result<()>;

    /// Non-streaming send; the full answer comes back in the response
    async fn send_message(
        &self,
        message: &str,
        session_id: Option<&str>,
    ) -> ragchat_core::Result<SendReply>;

    /// Backend health document
    async fn health(&self) -> ragchat_core::Result<Value>;
}

/// Persistent push-event connection
///
/// All methods are non-blocking. Handlers run on the connection's task, one
/// frame at a time, in frame order.
pub trait EventChannel: Send + Sync {
    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Register a handler for a named event. Handlers for the same name run
    /// in registration order.
    fn on(&self, event: &str, handler: EventHandler);

    /// Register a connection state listener
    fn on_state(&self, listener: StateListener);

    /// Fire-and-forget push of a command. Fails when the connection is not open.
    fn emit(&self, event: &str, payload: Value) -> ragchat_core::Result<()>;

    /// Scope server pushes to a session. Must be re-issued after every reconnect.
    fn join_room(&self, session_id: &str) -> ragchat_core::Result<()> {
        let cmd = ClientCommand::JoinSession(session_id.to_string());
        self.emit(cmd.name(), cmd.payload())
    }

    /// Stop receiving pushes for a session
    fn leave_room(&self, session_id: &str) -> ragchat_core::Result<()> {
        let cmd = ClientCommand::LeaveSession(session_id.to_string());
        self.emit(cmd.name(), cmd.payload())
    }

    /// Begin connecting in the background. No-op for channels that are
    /// already connected.
    fn connect(&self) {}

    /// Stop reconnecting and close the connection without waiting
    fn disconnect(&self) {}
}

/// Ingestion status provider (informational only)
#[async_trait]
pub trait IngestionSource: Send + Sync {
    async fn ingestion_status(&self) -> ragchat_core::Result<IngestionStatus>;

    async fn trigger_ingestion(&self) -> ragchat_core::Result<()>;
}

/// Both transports to one backend
#[derive(Clone)]
pub struct Transport {
    pub http: Arc<HttpBackend>,
    pub events: Arc<SocketChannel>,
}

impl Transport {
    /// Build both transports from configuration. The event connection is not
    /// opened until [`SocketChannel::start`] runs.
    pub fn from_config(config: &Config) -> ragchat_core::Result<Self> {
        Ok(Self {
            http: Arc::new(HttpBackend::new(&config.backend)?),
            events: Arc::new(SocketChannel::new(
                config.backend.socket_url.clone(),
                config.transport.clone(),
            )),
        })
    }
}
