//! In-memory doubles of the transports for unit tests

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use ragchat_core::session::{ChatMessage, SessionInfo};
use ragchat_core::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::transport::{
    Backend, ConnectionState, EventChannel, EventHandler, History, SendReply, StateListener,
};

/// Backend that keeps sessions and histories in memory
#[derive(Default)]
pub(crate) struct FakeBackend {
    pub valid: Mutex<Vec<String>>,
    pub histories: Mutex<HashMap<String, Vec<ChatMessage>>>,
    pub reply: Mutex<Option<SendReply>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_create: AtomicBool,
    pub fail_validate: AtomicBool,
    pub fail_clear: AtomicBool,
    pub fail_history: AtomicBool,
    /// When set, history requests wait for a notification before answering
    pub history_gate: Mutex<Option<Arc<Notify>>>,
    created: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_valid(ids: &[&str]) -> Arc<Self> {
        let backend = Self::default();
        *backend.valid.lock() = ids.iter().map(|id| id.to_string()).collect();
        Arc::new(backend)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn called(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn create_session(&self) -> Result<String> {
        self.record("create".to_string());
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::transport(None, "connection refused"));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("session-{}", n);
        self.valid.lock().push(id.clone());
        Ok(id)
    }

    async fn validate_session(&self, session_id: &str) -> Result<bool> {
        self.record(format!("validate {}", session_id));
        if self.fail_validate.load(Ordering::SeqCst) {
            return Err(Error::transport(Some(500), "boom"));
        }
        Ok(self.valid.lock().iter().any(|id| id == session_id))
    }

    async fn session_info(&self, session_id: &str) -> Result<SessionInfo> {
        self.record(format!("info {}", session_id));
        if !self.valid.lock().iter().any(|id| id == session_id) {
            return Err(Error::transport(Some(404), r#"{"error":"Session not found"}"#));
        }
        let created_at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        Ok(SessionInfo {
            id: session_id.to_string(),
            created_at,
            last_activity: created_at,
            message_count: 0,
        })
    }

    async fn get_history(&self, session_id: &str, limit: u32) -> Result<History> {
        self.record(format!("history {} {}", session_id, limit));
        let gate = self.history_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(Error::transport(Some(500), "history unavailable"));
        }
        let messages = self
            .histories
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        Ok(History {
            count: messages.len() as u64,
            messages,
        })
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        self.record(format!("clear {}", session_id));
        if self.fail_clear.load(Ordering::SeqCst) {
            return Err(Error::transport(Some(500), r#"{"error":"Failed to clear session"}"#));
        }
        self.histories.lock().remove(session_id);
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.record(format!("delete {}", session_id));
        self.valid.lock().retain(|id| id != session_id);
        Ok(())
    }

    async fn send_message(&self, message: &str, session_id: Option<&str>) -> Result<SendReply> {
        self.record(format!("send {} {}", session_id.unwrap_or("-"), message));
        self.reply
            .lock()
            .clone()
            .ok_or_else(|| Error::transport(None, "connection refused"))
    }

    async fn health(&self) -> Result<Value> {
        Ok(json!({ "status": "ok" }))
    }
}

/// Event channel driven by the test
pub(crate) struct FakeChannel {
    state: Mutex<ConnectionState>,
    handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
    listeners: Mutex<Vec<StateListener>>,
    pub emitted: Mutex<Vec<(String, Value)>>,
}

impl FakeChannel {
    pub fn new(state: ConnectionState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            handlers: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            emitted: Mutex::new(Vec::new()),
        })
    }

    /// Deliver a server push to the registered handlers
    pub fn push(&self, event: &str, data: Value) {
        let handlers = self.handlers.lock().get(event).cloned().unwrap_or_default();
        for handler in handlers {
            handler(&data);
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(state);
        }
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.lock().get(event).map(Vec::len).unwrap_or(0)
    }

    /// Payloads emitted under a name, in order
    pub fn emitted(&self, event: &str) -> Vec<Value> {
        self.emitted
            .lock()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl EventChannel for FakeChannel {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    fn on_state(&self, listener: StateListener) {
        self.listeners.lock().push(listener);
    }

    fn emit(&self, event: &str, payload: Value) -> Result<()> {
        if self.state() != ConnectionState::Open {
            return Err(Error::Connection(format!("Event connection is {}", self.state())));
        }
        self.emitted.lock().push((event.to_string(), payload));
        Ok(())
    }
}
